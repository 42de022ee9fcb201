// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # PubSub runtime core
//!
//! The component tree and its lifecycle:
//!
//! ```text
//! PubSubManager
//!   +-- Connection*              (transport binding)
//!   |     +-- WriterGroup*       (publish timer, wire format)
//!   |     |     +-- DataSetWriter* --> PublishedDataSet
//!   |     +-- ReaderGroup*       (receive demux)
//!   |           +-- DataSetReader* --> SubscribedDataSet
//!   +-- PublishedDataSet*
//!   +-- SubscribedDataSet*
//! ```
//!
//! Every component runs the five-state machine (Disabled, Paused,
//! PreOperational, Operational, Error). Disabled and Error are manual
//! states; the others recover towards Operational automatically as their
//! preconditions become true. A parent state change re-evaluates all
//! children with the child's current state as the target.
//!
//! All state lives behind one mutex ([`PubSubManager`] is a cloneable
//! handle). Timer and transport callbacks acquire the same mutex from the
//! event-loop thread, so handlers run to completion without suspension
//! points. Application hooks are invoked with the lock held and must not
//! call back into the manager; defer follow-up work with
//! [`EventLoop::add_delayed_callback`].

mod connection;
mod dataset_reader;
mod dataset_writer;
mod published_dataset;
mod reader_group;
mod subscribed_dataset;
mod writer_group;

pub mod config;
#[cfg(feature = "information-model")]
pub mod info_model;
#[cfg(feature = "sks")]
pub mod sks;

pub use connection::{NetworkAddressUrl, PubSubConnectionConfig};
pub use dataset_reader::{DataSetReaderConfig, FieldTarget};
pub use dataset_writer::{
    DataSetWriterConfig, UadpDataSetWriterMessageSettings, DSM_CONTENT_MASK_MAJOR_VERSION,
    DSM_CONTENT_MASK_MINOR_VERSION, DSM_CONTENT_MASK_PICOSECONDS, DSM_CONTENT_MASK_SEQUENCE_NUMBER,
    DSM_CONTENT_MASK_STATUS, DSM_CONTENT_MASK_TIMESTAMP, FIELD_CONTENT_MASK_RAW_DATA,
    FIELD_CONTENT_MASK_SERVER_PICOSECONDS, FIELD_CONTENT_MASK_SERVER_TIMESTAMP,
    FIELD_CONTENT_MASK_SOURCE_PICOSECONDS, FIELD_CONTENT_MASK_SOURCE_TIMESTAMP,
    FIELD_CONTENT_MASK_STATUS_CODE,
};
pub use published_dataset::{
    DataSetFieldConfig, PublishedDataSetConfig, PublishedDataSetType, PublishedVariable,
};
pub use reader_group::{ReaderGroupConfig, ReaderGroupTransportSettings};
pub use subscribed_dataset::{SubscribedDataSetConfig, SubscribedDataSetKind};
pub use writer_group::{
    MessageEncoding, UadpWriterGroupMessageSettings, WriterGroupConfig, WriterGroupTransportSettings,
    NM_CONTENT_MASK_DATASET_CLASS_ID, NM_CONTENT_MASK_GROUP_HEADER, NM_CONTENT_MASK_GROUP_VERSION,
    NM_CONTENT_MASK_NETWORK_MESSAGE_NUMBER, NM_CONTENT_MASK_PAYLOAD_HEADER,
    NM_CONTENT_MASK_PICOSECONDS, NM_CONTENT_MASK_PROMOTED_FIELDS, NM_CONTENT_MASK_PUBLISHER_ID,
    NM_CONTENT_MASK_SEQUENCE_NUMBER, NM_CONTENT_MASK_TIMESTAMP, NM_CONTENT_MASK_WRITER_GROUP_ID,
};

pub(crate) use connection::Connection;
pub(crate) use dataset_reader::DataSetReader;
pub(crate) use dataset_writer::DataSetWriter;
pub(crate) use published_dataset::PublishedDataSet;
pub(crate) use reader_group::ReaderGroup;
pub(crate) use subscribed_dataset::SubscribedDataSet;
pub(crate) use writer_group::WriterGroup;

use crate::eventloop::EventLoop;
use crate::host::HostServices;
use crate::transport::ConnectionManager;
use crate::types::{Identifier, NodeId, StatusCode};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

/// Namespace index used for runtime-assigned component node ids.
pub const PUBSUB_NAMESPACE: u16 = 1;

/// Number of receive channel slots per Connection / ReaderGroup.
pub const MAX_CHANNELS: usize = 8;

/// Repeat identical receive diagnostics at most every 10 s.
pub(crate) const SILENCE_ERROR_TICKS: i64 = 10 * 10_000_000;

// ============================================================================
// States, kinds, component head
// ============================================================================

/// Lifecycle state of a PubSub component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PubSubState {
    #[default]
    Disabled,
    Paused,
    PreOperational,
    Operational,
    Error,
}

impl PubSubState {
    /// Enabled means the machine drives the component towards Operational.
    #[must_use]
    pub fn is_enabled(self) -> bool {
        !matches!(self, PubSubState::Disabled | PubSubState::Error)
    }

    /// Ordering for the parent/child invariant:
    /// Disabled = Error < Paused < PreOperational < Operational.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            PubSubState::Disabled | PubSubState::Error => 0,
            PubSubState::Paused => 1,
            PubSubState::PreOperational => 2,
            PubSubState::Operational => 3,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            PubSubState::Disabled => "Disabled",
            PubSubState::Paused => "Paused",
            PubSubState::PreOperational => "PreOperational",
            PubSubState::Operational => "Operational",
            PubSubState::Error => "Error",
        }
    }
}

/// Component kinds of the containment tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Connection,
    WriterGroup,
    DataSetWriter,
    ReaderGroup,
    DataSetReader,
    PublishedDataSet,
    SubscribedDataSet,
}

impl ComponentKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ComponentKind::Connection => "Connection",
            ComponentKind::WriterGroup => "WriterGroup",
            ComponentKind::DataSetWriter => "DataSetWriter",
            ComponentKind::ReaderGroup => "ReaderGroup",
            ComponentKind::DataSetReader => "DataSetReader",
            ComponentKind::PublishedDataSet => "PublishedDataSet",
            ComponentKind::SubscribedDataSet => "SubscribedDataSet",
        }
    }
}

/// Shared head of every component.
#[derive(Debug, Clone)]
pub(crate) struct ComponentHead {
    pub id: u32,
    pub node_id: NodeId,
    pub kind: ComponentKind,
    pub state: PubSubState,
    /// Precomputed logging prefix ("WriterGroup 5 (grp) |").
    pub log_id: String,
    /// Set while a cascading state update is in progress; nested calls skip
    /// notifications so only the outermost transition emits them.
    pub transient: bool,
}

impl ComponentHead {
    pub(crate) fn new(id: u32, kind: ComponentKind, name: &str) -> Self {
        let log_id = if name.is_empty() {
            format!("{} {} |", kind.name(), id)
        } else {
            format!("{} {} ({}) |", kind.name(), id, name)
        };
        ComponentHead {
            id,
            node_id: NodeId::numeric(PUBSUB_NAMESPACE, id),
            kind,
            state: PubSubState::Disabled,
            log_id,
            transient: false,
        }
    }
}

/// Manager lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PubSubLifecycleState {
    #[default]
    Stopped,
    Started,
    Stopping,
}

// ============================================================================
// Application hooks
// ============================================================================

/// Invoked before the state machine runs; may remap the target state.
pub type BeforeStateChangeCallback = Arc<dyn Fn(&NodeId, &mut PubSubState) + Send + Sync>;

/// Invoked once per actual state change with the error reason.
pub type StateChangeCallback = Arc<dyn Fn(&NodeId, PubSubState, StatusCode) + Send + Sync>;

/// Asked before a component is created (`removing == false`) or removed
/// (`removing == true`); a bad status vetoes the operation.
pub type ComponentLifecycleCallback =
    Arc<dyn Fn(&NodeId, ComponentKind, bool) -> StatusCode + Send + Sync>;

/// Replaces the default state machine of one component:
/// `(component, current, target) -> (new_state, reason)`.
pub type CustomStateMachine =
    Arc<dyn Fn(&NodeId, PubSubState, PubSubState) -> (PubSubState, StatusCode) + Send + Sync>;

#[derive(Default, Clone)]
pub struct PubSubCallbacks {
    pub before_state_change: Option<BeforeStateChangeCallback>,
    pub state_change: Option<StateChangeCallback>,
    pub component_lifecycle: Option<ComponentLifecycleCallback>,
}

// ============================================================================
// Reserved id pools
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReserveIdKind {
    WriterGroup,
    DataSetWriter,
}

#[derive(Debug, Clone)]
pub(crate) struct ReserveId {
    pub id: u16,
    pub kind: ReserveIdKind,
    pub session: NodeId,
    pub transport_profile_uri: String,
}

// ============================================================================
// Manager state
// ============================================================================

pub(crate) struct Psm {
    pub lifecycle: PubSubLifecycleState,
    pub self_ref: Weak<Mutex<Psm>>,
    pub event_loop: Arc<dyn EventLoop>,
    pub host: Arc<dyn HostServices>,
    pub transports: HashMap<&'static str, Arc<dyn ConnectionManager>>,
    pub callbacks: PubSubCallbacks,
    pub next_id: u32,
    pub default_publisher_id: u64,

    pub connections: BTreeMap<u32, Connection>,
    pub writer_groups: BTreeMap<u32, WriterGroup>,
    pub dataset_writers: BTreeMap<u32, DataSetWriter>,
    pub reader_groups: BTreeMap<u32, ReaderGroup>,
    pub dataset_readers: BTreeMap<u32, DataSetReader>,
    pub published_datasets: BTreeMap<u32, PublishedDataSet>,
    pub subscribed_datasets: BTreeMap<u32, SubscribedDataSet>,

    pub reserve_ids: Vec<ReserveId>,

    #[cfg(feature = "sks")]
    pub security_groups: BTreeMap<u32, sks::SecurityGroup>,
    #[cfg(feature = "sks")]
    pub key_storages: HashMap<String, Arc<Mutex<crate::security::keystorage::KeyStorage>>>,

    #[cfg(feature = "information-model")]
    pub info_model: bool,
}

impl Psm {
    pub(crate) fn generate_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn generate_guid(&mut self) -> crate::types::Guid {
        let id = self.generate_id();
        let stamp = crate::types::DateTime::now().0 as u128;
        crate::types::Guid::from_u128((stamp << 32) | id as u128)
    }

    /// Numeric part of a runtime component NodeId.
    pub(crate) fn component_id(node: &NodeId) -> crate::Result<u32> {
        if node.namespace != PUBSUB_NAMESPACE {
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        match node.identifier {
            Identifier::Numeric(n) => Ok(n),
            _ => Err(StatusCode::BAD_NOT_FOUND),
        }
    }

    /// Check the lifecycle veto hook.
    pub(crate) fn check_lifecycle(
        &self,
        node: &NodeId,
        kind: ComponentKind,
        removing: bool,
    ) -> crate::Result<()> {
        if let Some(cb) = self.callbacks.component_lifecycle.clone() {
            cb(node, kind, removing).into_result()?;
        }
        Ok(())
    }

    /// Emit the state-change notification (log + hook).
    pub(crate) fn notify_state_change(
        &self,
        log_id: &str,
        node: &NodeId,
        old: PubSubState,
        new: PubSubState,
        reason: StatusCode,
    ) {
        log::info!("{} {} -> {}", log_id, old.name(), new.name());
        #[cfg(feature = "information-model")]
        self.info_model_sync_state(node, new);
        if let Some(cb) = self.callbacks.state_change.clone() {
            cb(node, new, reason);
        }
    }

    pub(crate) fn run_before_hook(&self, node: &NodeId, target: &mut PubSubState) {
        if let Some(cb) = self.callbacks.before_state_change.clone() {
            cb(node, target);
        }
    }

    /// Lifecycle re-evaluation: Stopping drains to Stopped once the last
    /// channel of the last connection has closed.
    pub(crate) fn update_lifecycle(&mut self) {
        if self.lifecycle != PubSubLifecycleState::Stopping {
            return;
        }
        let open = self.connections.values().any(|c| c.has_open_channels());
        if !open {
            self.lifecycle = PubSubLifecycleState::Stopped;
            log::info!("PubSubManager | Stopped");
        }
    }

    /// Resolve the transport for a protocol. A registered loopback manager
    /// stands in for missing protocols (intra-process mode).
    pub(crate) fn transport(&self, protocol: &str) -> crate::Result<Arc<dyn ConnectionManager>> {
        self.transports
            .get(protocol)
            .or_else(|| self.transports.get("loopback"))
            .cloned()
            .ok_or(StatusCode::BAD_NOT_SUPPORTED)
    }

    /// State lookup across all component kinds.
    pub(crate) fn component_state(&self, id: u32) -> Option<(ComponentKind, PubSubState)> {
        if let Some(c) = self.connections.get(&id) {
            return Some((ComponentKind::Connection, c.head.state));
        }
        if let Some(c) = self.writer_groups.get(&id) {
            return Some((ComponentKind::WriterGroup, c.head.state));
        }
        if let Some(c) = self.dataset_writers.get(&id) {
            return Some((ComponentKind::DataSetWriter, c.head.state));
        }
        if let Some(c) = self.reader_groups.get(&id) {
            return Some((ComponentKind::ReaderGroup, c.head.state));
        }
        if let Some(c) = self.dataset_readers.get(&id) {
            return Some((ComponentKind::DataSetReader, c.head.state));
        }
        None
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// Cloneable handle to the PubSub runtime. All operations serialize on one
/// internal mutex (the "server mutex" of the concurrency model).
#[derive(Clone)]
pub struct PubSubManager {
    pub(crate) psm: Arc<Mutex<Psm>>,
}

pub struct PubSubManagerBuilder {
    event_loop: Option<Arc<dyn EventLoop>>,
    host: Option<Arc<dyn HostServices>>,
    transports: Vec<Arc<dyn ConnectionManager>>,
    callbacks: PubSubCallbacks,
    default_publisher_id: u64,
    #[cfg(feature = "information-model")]
    info_model: bool,
}

impl PubSubManagerBuilder {
    #[must_use]
    pub fn event_loop(mut self, el: Arc<dyn EventLoop>) -> Self {
        self.event_loop = Some(el);
        self
    }

    #[must_use]
    pub fn host(mut self, host: Arc<dyn HostServices>) -> Self {
        self.host = Some(host);
        self
    }

    /// Register a transport. The connection profile table resolves managers
    /// by protocol name.
    #[must_use]
    pub fn transport(mut self, cm: Arc<dyn ConnectionManager>) -> Self {
        self.transports.push(cm);
        self
    }

    #[must_use]
    pub fn callbacks(mut self, callbacks: PubSubCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    #[must_use]
    pub fn default_publisher_id(mut self, id: u64) -> Self {
        self.default_publisher_id = id;
        self
    }

    /// Mirror components into the host address space.
    #[cfg(feature = "information-model")]
    #[must_use]
    pub fn information_model(mut self, enabled: bool) -> Self {
        self.info_model = enabled;
        self
    }

    pub fn build(self) -> crate::Result<PubSubManager> {
        let event_loop = self.event_loop.ok_or(StatusCode::BAD_INVALID_ARGUMENT)?;
        let host = self.host.ok_or(StatusCode::BAD_INVALID_ARGUMENT)?;

        let mut transports: HashMap<&'static str, Arc<dyn ConnectionManager>> = HashMap::new();
        for cm in self.transports {
            transports.insert(cm.protocol(), cm);
        }

        let default_publisher_id = if self.default_publisher_id != 0 {
            self.default_publisher_id
        } else {
            crate::types::DateTime::now().0 as u64
        };

        let psm = Arc::new(Mutex::new(Psm {
            lifecycle: PubSubLifecycleState::Stopped,
            self_ref: Weak::new(),
            event_loop,
            host,
            transports,
            callbacks: self.callbacks,
            next_id: 0,
            default_publisher_id,
            connections: BTreeMap::new(),
            writer_groups: BTreeMap::new(),
            dataset_writers: BTreeMap::new(),
            reader_groups: BTreeMap::new(),
            dataset_readers: BTreeMap::new(),
            published_datasets: BTreeMap::new(),
            subscribed_datasets: BTreeMap::new(),
            reserve_ids: Vec::new(),
            #[cfg(feature = "sks")]
            security_groups: BTreeMap::new(),
            #[cfg(feature = "sks")]
            key_storages: HashMap::new(),
            #[cfg(feature = "information-model")]
            info_model: self.info_model,
        }));
        psm.lock().self_ref = Arc::downgrade(&psm);
        Ok(PubSubManager { psm })
    }
}

impl PubSubManager {
    #[must_use]
    pub fn builder() -> PubSubManagerBuilder {
        PubSubManagerBuilder {
            event_loop: None,
            host: None,
            transports: Vec::new(),
            callbacks: PubSubCallbacks::default(),
            default_publisher_id: 0,
            #[cfg(feature = "information-model")]
            info_model: false,
        }
    }

    /// Start the manager: Paused components recover towards Operational.
    pub fn start(&self) {
        let mut psm = self.psm.lock();
        psm.lifecycle = PubSubLifecycleState::Started;
        log::info!("PubSubManager | Started");
        let ids: Vec<u32> = psm.connections.keys().copied().collect();
        for id in ids {
            let current = psm.connections[&id].head.state;
            let _ = psm.connection_set_state(id, current);
        }
    }

    /// Stop the manager: all connections are torn down. The state reaches
    /// Stopped once the last channel has signalled Closing.
    pub fn stop(&self) {
        let mut psm = self.psm.lock();
        psm.lifecycle = PubSubLifecycleState::Stopping;
        log::info!("PubSubManager | Stopping");
        let ids: Vec<u32> = psm.connections.keys().copied().collect();
        for id in ids {
            let current = psm.connections[&id].head.state;
            // Re-running with the current state pauses/tears down everything
            // because the manager is no longer Started.
            let _ = psm.connection_set_state(id, current);
            psm.connection_disconnect(id);
        }
        psm.update_lifecycle();
    }

    #[must_use]
    pub fn lifecycle_state(&self) -> PubSubLifecycleState {
        self.psm.lock().lifecycle
    }

    /// State of any Connection / group / writer / reader component.
    pub fn component_state(&self, node: &NodeId) -> crate::Result<PubSubState> {
        let psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.component_state(id).map(|(_, s)| s).ok_or(StatusCode::BAD_NOT_FOUND)
    }

    /// Reserve currently unused WriterGroupIds / DataSetWriterIds for a
    /// client session.
    pub fn reserve_ids(
        &self,
        session: &NodeId,
        num_writer_group_ids: u16,
        num_dataset_writer_ids: u16,
        transport_profile_uri: &str,
    ) -> crate::Result<(Vec<u16>, Vec<u16>)> {
        let mut psm = self.psm.lock();

        let used_wg: std::collections::HashSet<u16> = psm
            .writer_groups
            .values()
            .map(|wg| wg.config.writer_group_id)
            .chain(
                psm.reserve_ids
                    .iter()
                    .filter(|r| r.kind == ReserveIdKind::WriterGroup)
                    .map(|r| r.id),
            )
            .collect();
        let used_dsw: std::collections::HashSet<u16> = psm
            .dataset_writers
            .values()
            .map(|w| w.config.dataset_writer_id)
            .chain(
                psm.reserve_ids
                    .iter()
                    .filter(|r| r.kind == ReserveIdKind::DataSetWriter)
                    .map(|r| r.id),
            )
            .collect();

        let pick = |used: &std::collections::HashSet<u16>, n: u16| -> crate::Result<Vec<u16>> {
            let mut out = Vec::with_capacity(n as usize);
            let mut candidate: u32 = 1;
            while out.len() < n as usize {
                if candidate > u16::MAX as u32 {
                    return Err(StatusCode::BAD_OUT_OF_MEMORY);
                }
                let c = candidate as u16;
                if !used.contains(&c) && !out.contains(&c) {
                    out.push(c);
                }
                candidate += 1;
            }
            Ok(out)
        };

        let wg_ids = pick(&used_wg, num_writer_group_ids)?;
        let dsw_ids = pick(&used_dsw, num_dataset_writer_ids)?;

        for id in &wg_ids {
            psm.reserve_ids.push(ReserveId {
                id: *id,
                kind: ReserveIdKind::WriterGroup,
                session: session.clone(),
                transport_profile_uri: transport_profile_uri.to_string(),
            });
        }
        for id in &dsw_ids {
            psm.reserve_ids.push(ReserveId {
                id: *id,
                kind: ReserveIdKind::DataSetWriter,
                session: session.clone(),
                transport_profile_uri: transport_profile_uri.to_string(),
            });
        }
        Ok((wg_ids, dsw_ids))
    }

    /// Release the reservations of one session (or all with a null session).
    pub fn free_reserved_ids(&self, session: &NodeId) {
        let mut psm = self.psm.lock();
        if session.is_null() {
            psm.reserve_ids.clear();
        } else {
            psm.reserve_ids.retain(|r| &r.session != session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventloop::DefaultEventLoop;
    use crate::host::MemoryAddressSpace;

    fn manager() -> PubSubManager {
        PubSubManager::builder()
            .event_loop(Arc::new(DefaultEventLoop::new()))
            .host(Arc::new(MemoryAddressSpace::new()))
            .build()
            .expect("build manager")
    }

    #[test]
    fn test_lifecycle() {
        let m = manager();
        assert_eq!(m.lifecycle_state(), PubSubLifecycleState::Stopped);
        m.start();
        assert_eq!(m.lifecycle_state(), PubSubLifecycleState::Started);
        m.stop();
        // no connections, so stopping drains immediately
        assert_eq!(m.lifecycle_state(), PubSubLifecycleState::Stopped);
    }

    #[test]
    fn test_state_rank_order() {
        assert!(PubSubState::Disabled.rank() < PubSubState::Paused.rank());
        assert!(PubSubState::Paused.rank() < PubSubState::PreOperational.rank());
        assert!(PubSubState::PreOperational.rank() < PubSubState::Operational.rank());
        assert_eq!(PubSubState::Error.rank(), PubSubState::Disabled.rank());
        assert!(!PubSubState::Error.is_enabled());
        assert!(PubSubState::Paused.is_enabled());
    }

    #[test]
    fn test_reserve_ids() {
        let m = manager();
        let session = NodeId::numeric(3, 77);
        let (wg, dsw) = m.reserve_ids(&session, 3, 2, crate::protocol::PROFILE_UDP_UADP)
            .expect("reserve");
        assert_eq!(wg.len(), 3);
        assert_eq!(dsw.len(), 2);

        // A second reservation avoids the first one's ids.
        let (wg2, _) = m.reserve_ids(&session, 3, 0, crate::protocol::PROFILE_UDP_UADP)
            .expect("reserve");
        assert!(wg.iter().all(|id| !wg2.contains(id)));

        m.free_reserved_ids(&session);
        let (wg3, _) = m.reserve_ids(&session, 3, 0, crate::protocol::PROFILE_UDP_UADP)
            .expect("reserve");
        assert_eq!(wg, wg3);
    }

    #[test]
    fn test_unknown_component_state() {
        let m = manager();
        assert_eq!(
            m.component_state(&NodeId::numeric(PUBSUB_NAMESPACE, 999)),
            Err(StatusCode::BAD_NOT_FOUND)
        );
        assert_eq!(
            m.component_state(&NodeId::ns0(1)),
            Err(StatusCode::BAD_NOT_FOUND)
        );
    }
}
