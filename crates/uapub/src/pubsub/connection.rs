// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PubSubConnection: transport binding and channel bookkeeping.
//!
//! A Connection owns up to [`MAX_CHANNELS`](super::MAX_CHANNELS) receive
//! channels and one send channel on its ConnectionManager. Send channels
//! serve WriterGroups, receive channels serve ReaderGroups; groups with
//! their own transport settings (MQTT topics, UDP unicast targets) hold
//! dedicated channels instead. Channels are opened only while the component
//! tree needs them and the final free of a delete-flagged Connection waits
//! for every channel to signal Closing.

use super::{
    ComponentHead, ComponentKind, CustomStateMachine, Psm, PubSubLifecycleState, PubSubManager,
    PubSubState, MAX_CHANNELS, SILENCE_ERROR_TICKS,
};
use crate::protocol::{PublisherId, TransportProfile};
use crate::transport::{url, ChannelEvent, ChannelId, ChannelState, ConnectionParams};
use crate::types::{KeyValuePair, NodeId, StatusCode};
use std::sync::Arc;

/// Network address of a connection: an endpoint URL plus an optional
/// interface name.
#[derive(Debug, Clone, Default)]
pub struct NetworkAddressUrl {
    pub network_interface: String,
    pub url: String,
}

#[derive(Clone, Default)]
pub struct PubSubConnectionConfig {
    pub name: String,
    /// Publisher identity; `None` takes the manager default.
    pub publisher_id: Option<PublisherId>,
    pub transport_profile_uri: String,
    pub address: NetworkAddressUrl,
    pub connection_properties: Vec<KeyValuePair>,
    pub custom_state_machine: Option<CustomStateMachine>,
}

pub(crate) struct Connection {
    pub head: ComponentHead,
    pub config: PubSubConnectionConfig,
    pub profile: TransportProfile,
    pub publisher_id: PublisherId,

    pub send_channel: ChannelId,
    pub recv_channels: [ChannelId; MAX_CHANNELS],

    pub writer_groups: Vec<u32>,
    pub reader_groups: Vec<u32>,

    pub delete_flag: bool,
    /// Monotonic deadline suppressing repeated receive diagnostics.
    pub silence_error_until: i64,
}

impl Connection {
    pub(crate) fn recv_channel_count(&self) -> usize {
        self.recv_channels.iter().filter(|c| **c != 0).count()
    }

    pub(crate) fn has_open_channels(&self) -> bool {
        self.send_channel != 0 || self.recv_channel_count() > 0
    }

    /// Attach a send channel: empty slot or idempotent re-attach only.
    pub(crate) fn attach_send(&mut self, id: ChannelId) -> crate::Result<()> {
        if self.send_channel != 0 && self.send_channel != id {
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }
        log::info!("{} attach send-channel {}", self.head.log_id, id);
        self.send_channel = id;
        Ok(())
    }

    /// Attach a receive channel: idempotent, first free slot.
    pub(crate) fn attach_recv(&mut self, id: ChannelId) -> crate::Result<()> {
        if self.recv_channels.contains(&id) {
            return Ok(());
        }
        for slot in &mut self.recv_channels {
            if *slot == 0 {
                log::info!("{} attach receive-channel {}", self.head.log_id, id);
                *slot = id;
                return Ok(());
            }
        }
        Err(StatusCode::BAD_INTERNAL_ERROR)
    }

    /// Clear whichever slot holds `id`.
    pub(crate) fn detach(&mut self, id: ChannelId) {
        if self.send_channel == id {
            log::info!("{} detach send-channel {}", self.head.log_id, id);
            self.send_channel = 0;
            return;
        }
        for slot in &mut self.recv_channels {
            if *slot == id {
                log::info!("{} detach receive-channel {}", self.head.log_id, id);
                *slot = 0;
                return;
            }
        }
    }
}

impl Psm {
    /// A connection needs the transport iff a group lacks its channel.
    pub(crate) fn connection_can_connect(&self, id: u32) -> bool {
        let Some(c) = self.connections.get(&id) else { return false };
        (c.send_channel == 0 && !c.writer_groups.is_empty())
            || (c.recv_channel_count() == 0 && !c.reader_groups.is_empty())
    }

    fn connection_params(&self, id: u32, listen: bool, validate: bool) -> crate::Result<ConnectionParams> {
        let c = self.connections.get(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
        let addr = url::parse_url(&c.config.address.url)?;
        Ok(ConnectionParams {
            address: if listen && addr.is_receive_all() { String::new() } else { addr.host.clone() },
            port: addr.port,
            listen,
            reuse: true,
            loopback: true,
            interface: if c.config.address.network_interface.is_empty() {
                None
            } else {
                Some(c.config.address.network_interface.clone())
            },
            topic: None,
            subscribe: false,
            validate,
        })
    }

    fn channel_callback(&self, conn_id: u32) -> crate::transport::ChannelCallback {
        let weak = self.self_ref.clone();
        Arc::new(move |ev: &ChannelEvent| {
            let Some(psm) = weak.upgrade() else { return };
            let mut psm = psm.lock();
            psm.connection_channel_event(conn_id, ev);
        })
    }

    /// Open the shared channels of the connection (async; outcomes arrive as
    /// channel events).
    pub(crate) fn connection_connect(&mut self, id: u32, validate: bool) -> crate::Result<()> {
        let (profile, need_send, need_recv) = {
            let c = self.connections.get(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
            (
                c.profile,
                c.send_channel == 0 && !c.writer_groups.is_empty(),
                c.recv_channel_count() == 0 && !c.reader_groups.is_empty(),
            )
        };

        // MQTT channels belong to the groups (they carry the topics).
        if profile.protocol() == "mqtt" {
            return Ok(());
        }

        let cm = self.transport(profile.protocol())?;
        let cb = self.channel_callback(id);

        if need_recv {
            let params = self.connection_params(id, true, validate)?;
            cm.open_connection(&params, cb.clone())?;
        }
        if need_send {
            let params = self.connection_params(id, false, validate)?;
            cm.open_connection(&params, cb)?;
        }
        Ok(())
    }

    /// Close all channels of the connection (shared and group-owned).
    pub(crate) fn connection_disconnect(&mut self, id: u32) {
        let Some(c) = self.connections.get(&id) else { return };
        let Ok(cm) = self.transport(c.profile.protocol()) else { return };
        if c.send_channel != 0 {
            cm.close_connection(c.send_channel);
        }
        for ch in c.recv_channels {
            if ch != 0 {
                cm.close_connection(ch);
            }
        }
    }

    /// Handle a channel event delivered by the transport.
    pub(crate) fn connection_channel_event(&mut self, conn_id: u32, ev: &ChannelEvent) {
        if !self.connections.contains_key(&conn_id) {
            return;
        }

        if ev.state == ChannelState::Closing {
            let (delete_flag, open, was_operational) = {
                let c = self.connections.get_mut(&conn_id).expect("present");
                c.detach(ev.channel);
                (c.delete_flag, c.has_open_channels(), c.head.state == PubSubState::Operational)
            };

            if delete_flag && !open {
                self.connection_finalize_delete(conn_id);
                self.update_lifecycle();
                return;
            }

            // Reconnect automatically if the connection was operational.
            if was_operational {
                let _ = self.connection_set_state(conn_id, PubSubState::Operational);
            }
            self.update_lifecycle();
            return;
        }

        if ev.state == ChannelState::Opening {
            return;
        }

        // Store the channel id (idempotent for known ids).
        let res = {
            let c = self.connections.get_mut(&conn_id).expect("present");
            if ev.recv { c.attach_recv(ev.channel) } else { c.attach_send(ev.channel) }
        };
        if res.is_err() {
            let c = self.connections.get(&conn_id).expect("present");
            log::warn!("{} no free channel slot, closing channel {}", c.head.log_id, ev.channel);
            if let Ok(cm) = self.transport(c.profile.protocol()) {
                cm.close_connection(ev.channel);
            }
            return;
        }

        // Channel open: re-evaluate the state machine.
        let current = self.connections[&conn_id].head.state;
        let _ = self.connection_set_state(conn_id, current);

        if ev.recv && !ev.bytes.is_empty() {
            self.connection_process(conn_id, ev.bytes);
        }
    }

    /// Connection state machine (see the table in the module docs).
    pub(crate) fn connection_set_state(
        &mut self,
        id: u32,
        mut target: PubSubState,
    ) -> crate::Result<()> {
        let (node, delete_flag, custom) = {
            let c = self.connections.get(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
            (c.head.node_id.clone(), c.delete_flag, c.config.custom_state_machine.clone())
        };
        if delete_flag && target != PubSubState::Disabled {
            log::warn!(
                "{} the connection is being deleted, it can only be disabled",
                self.connections[&id].head.log_id
            );
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }

        self.run_before_hook(&node, &mut target);

        let (old, was_transient) = {
            let c = self.connections.get_mut(&id).expect("present");
            let t = c.head.transient;
            c.head.transient = true;
            (c.head.state, t)
        };

        let mut reason = StatusCode::GOOD;
        if let Some(csm) = custom {
            let (new_state, status) = csm(&node, old, target);
            self.connections.get_mut(&id).expect("present").head.state = new_state;
            reason = status;
        } else {
            match target {
                PubSubState::Disabled | PubSubState::Error => {
                    self.connection_disconnect(id);
                    self.connections.get_mut(&id).expect("present").head.state = target;
                }
                PubSubState::Paused | PubSubState::PreOperational | PubSubState::Operational => {
                    if self.lifecycle != PubSubLifecycleState::Started {
                        if old != PubSubState::Paused {
                            log::warn!(
                                "{} cannot enable the connection while the manager is not \
                                 running -> Paused",
                                self.connections[&id].head.log_id
                            );
                        }
                        self.connections.get_mut(&id).expect("present").head.state =
                            PubSubState::Paused;
                        self.connection_disconnect(id);
                    } else {
                        // Open what is missing; PreOperational until every
                        // needed channel has been attached.
                        if self.connection_can_connect(id) {
                            if let Err(e) = self.connection_connect(id, false) {
                                reason = e;
                            }
                        }
                        let new_state = if self.connection_can_connect(id) {
                            PubSubState::PreOperational
                        } else {
                            PubSubState::Operational
                        };
                        self.connections.get_mut(&id).expect("present").head.state = new_state;
                    }
                }
            }
            if reason.is_bad() {
                self.connections.get_mut(&id).expect("present").head.state = PubSubState::Error;
                self.connection_disconnect(id);
            }
        }

        // Only the outermost update notifies and cascades.
        let new = {
            let c = self.connections.get_mut(&id).expect("present");
            c.head.transient = was_transient;
            c.head.state
        };
        if was_transient {
            return reason.into_result();
        }

        if new != old {
            let log_id = self.connections[&id].head.log_id.clone();
            self.notify_state_change(&log_id, &node, old, new, reason);
        }

        // Children re-evaluate with their current state as the target.
        let rgs = self.connections[&id].reader_groups.clone();
        for rg in rgs {
            if let Some(current) = self.reader_groups.get(&rg).map(|g| g.head.state) {
                let _ = self.reader_group_set_state(rg, current);
            }
        }
        let wgs = self.connections[&id].writer_groups.clone();
        for wg in wgs {
            if let Some(current) = self.writer_groups.get(&wg).map(|g| g.head.state) {
                let _ = self.writer_group_set_state(wg, current);
            }
        }

        self.update_lifecycle();
        reason.into_result()
    }

    /// Unlink and drop a drained, delete-flagged connection. If children are
    /// still present the free is retried from a delayed callback.
    pub(crate) fn connection_finalize_delete(&mut self, id: u32) {
        let Some(c) = self.connections.get(&id) else { return };
        if c.has_open_channels() {
            return;
        }
        if !c.writer_groups.is_empty() || !c.reader_groups.is_empty() {
            let weak = self.self_ref.clone();
            self.event_loop.add_delayed_callback(Box::new(move || {
                let Some(psm) = weak.upgrade() else { return };
                psm.lock().connection_finalize_delete(id);
            }));
            return;
        }
        let c = self.connections.remove(&id).expect("present");
        log::info!("{} connection deleted", c.head.log_id);

        #[cfg(feature = "information-model")]
        self.unrepresent(&c.head.node_id);
    }

    /// Rate-limited diagnostic for messages no reader matched.
    pub(crate) fn connection_unmatched_warning(&mut self, id: u32, what: &str) {
        let now = self.event_loop.now_monotonic();
        let Some(c) = self.connections.get_mut(&id) else { return };
        if c.silence_error_until < now {
            log::warn!(
                "{} {} Check PublisherId, WriterGroupId and DataSetWriterId.",
                c.head.log_id,
                what
            );
            c.silence_error_until = now + SILENCE_ERROR_TICKS;
        }
    }
}

impl PubSubManager {
    /// Create a connection from a configuration copy. The connection starts
    /// Disabled.
    pub fn add_connection(&self, cfg: &PubSubConnectionConfig) -> crate::Result<NodeId> {
        let mut psm = self.psm.lock();
        let profile = TransportProfile::from_uri(&cfg.transport_profile_uri)?;
        // The address must parse for the profile's URL scheme.
        url::parse_url(&cfg.address.url)?;

        let publisher_id = cfg
            .publisher_id
            .clone()
            .unwrap_or(PublisherId::UInt64(psm.default_publisher_id));

        let id = psm.generate_id();
        let head = ComponentHead::new(id, ComponentKind::Connection, &cfg.name);
        psm.check_lifecycle(&head.node_id, ComponentKind::Connection, false)?;
        let node_id = head.node_id.clone();
        log::info!("{} connection created ({})", head.log_id, cfg.address.url);

        psm.connections.insert(
            id,
            Connection {
                head,
                config: cfg.clone(),
                profile,
                publisher_id,
                send_channel: 0,
                recv_channels: [0; MAX_CHANNELS],
                writer_groups: Vec::new(),
                reader_groups: Vec::new(),
                delete_flag: false,
                silence_error_until: 0,
            },
        );

        #[cfg(feature = "information-model")]
        psm.represent_connection(id);

        Ok(node_id)
    }

    /// Two-phase removal: flag, disable, drain channels, free.
    pub fn remove_connection(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        if !psm.connections.contains_key(&id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        psm.check_lifecycle(node, ComponentKind::Connection, true)?;

        psm.connections.get_mut(&id).expect("present").delete_flag = true;
        let _ = psm.connection_set_state(id, PubSubState::Disabled);

        // Disable and remove all groups below the connection.
        let rgs = psm.connections[&id].reader_groups.clone();
        for rg in rgs {
            let _ = psm.reader_group_set_state(rg, PubSubState::Disabled);
            psm.reader_group_remove(rg);
        }
        let wgs = psm.connections[&id].writer_groups.clone();
        for wg in wgs {
            let _ = psm.writer_group_set_state(wg, PubSubState::Disabled);
            psm.writer_group_remove(wg);
        }

        // Free now if nothing is open; otherwise the last Closing callback
        // finishes the job.
        psm.connection_finalize_delete(id);
        Ok(())
    }

    pub fn enable_connection(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.connection_set_state(id, PubSubState::Operational)
    }

    pub fn disable_connection(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.connection_set_state(id, PubSubState::Disabled)
    }

    pub fn get_connection_config(&self, node: &NodeId) -> crate::Result<PubSubConnectionConfig> {
        let psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.connections.get(&id).map(|c| c.config.clone()).ok_or(StatusCode::BAD_NOT_FOUND)
    }

    /// Replace the configuration. Only allowed while the connection is
    /// Disabled.
    pub fn update_connection_config(
        &self,
        node: &NodeId,
        cfg: &PubSubConnectionConfig,
    ) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        let profile = TransportProfile::from_uri(&cfg.transport_profile_uri)?;
        url::parse_url(&cfg.address.url)?;
        let default_pid = psm.default_publisher_id;
        let c = psm.connections.get_mut(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
        if c.head.state.is_enabled() {
            return Err(StatusCode::BAD_CONFIGURATION_ERROR);
        }
        c.publisher_id =
            cfg.publisher_id.clone().unwrap_or(PublisherId::UInt64(default_pid));
        c.config = cfg.clone();
        c.profile = profile;
        Ok(())
    }

    pub fn get_connection_state(&self, node: &NodeId) -> crate::Result<PubSubState> {
        let psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.connections.get(&id).map(|c| c.head.state).ok_or(StatusCode::BAD_NOT_FOUND)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.psm.lock().connections.len()
    }

    /// Feed a received buffer into a connection's demux (testing and
    /// out-of-band transports).
    pub fn process_connection_receive(&self, node: &NodeId, bytes: &[u8]) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        if !psm.connections.contains_key(&id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        psm.connection_process(id, bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventloop::DefaultEventLoop;
    use crate::host::MemoryAddressSpace;
    use crate::protocol::PROFILE_UDP_UADP;

    fn manager() -> PubSubManager {
        PubSubManager::builder()
            .event_loop(Arc::new(DefaultEventLoop::new()))
            .host(Arc::new(MemoryAddressSpace::new()))
            .build()
            .expect("build")
    }

    fn connection_cfg() -> PubSubConnectionConfig {
        PubSubConnectionConfig {
            name: "c1".into(),
            publisher_id: Some(PublisherId::UInt32(2234)),
            transport_profile_uri: PROFILE_UDP_UADP.into(),
            address: NetworkAddressUrl {
                network_interface: String::new(),
                url: "opc.udp://224.0.0.22:4840/".into(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_add_connection_bad_profile() {
        let m = manager();
        let mut cfg = connection_cfg();
        cfg.transport_profile_uri = "http://unknown.profile".into();
        assert!(m.add_connection(&cfg).is_err());
        assert_eq!(m.connection_count(), 0);
    }

    #[test]
    fn test_add_connection_bad_url() {
        let m = manager();
        let mut cfg = connection_cfg();
        cfg.address.url = "not-a-url".into();
        assert!(m.add_connection(&cfg).is_err());
        assert_eq!(m.connection_count(), 0);
    }

    #[test]
    fn test_enable_without_start_pauses() {
        let m = manager();
        let conn = m.add_connection(&connection_cfg()).expect("add");
        assert_eq!(m.get_connection_state(&conn), Ok(PubSubState::Disabled));
        m.enable_connection(&conn).expect("enable");
        assert_eq!(m.get_connection_state(&conn), Ok(PubSubState::Paused));
        m.start();
        // No groups -> nothing to connect -> Operational right away.
        assert_eq!(m.get_connection_state(&conn), Ok(PubSubState::Operational));
    }

    #[test]
    fn test_update_config_requires_disabled() {
        let m = manager();
        m.start();
        let conn = m.add_connection(&connection_cfg()).expect("add");
        m.enable_connection(&conn).expect("enable");
        assert_eq!(
            m.update_connection_config(&conn, &connection_cfg()),
            Err(StatusCode::BAD_CONFIGURATION_ERROR)
        );
        m.disable_connection(&conn).expect("disable");
        m.update_connection_config(&conn, &connection_cfg()).expect("update while disabled");
    }

    #[test]
    fn test_remove_without_channels_is_immediate() {
        let m = manager();
        let conn = m.add_connection(&connection_cfg()).expect("add");
        m.remove_connection(&conn).expect("remove");
        assert_eq!(m.connection_count(), 0);
        assert_eq!(m.remove_connection(&conn), Err(StatusCode::BAD_NOT_FOUND));
    }

    #[test]
    fn test_attach_slots() {
        let mut c = Connection {
            head: ComponentHead::new(1, ComponentKind::Connection, "t"),
            config: PubSubConnectionConfig::default(),
            profile: TransportProfile::UdpUadp,
            publisher_id: PublisherId::Byte(1),
            send_channel: 0,
            recv_channels: [0; MAX_CHANNELS],
            writer_groups: Vec::new(),
            reader_groups: Vec::new(),
            delete_flag: false,
            silence_error_until: 0,
        };
        assert!(c.attach_send(10).is_ok());
        assert!(c.attach_send(10).is_ok(), "idempotent");
        assert!(c.attach_send(11).is_err(), "occupied");

        for i in 0..MAX_CHANNELS as u64 {
            assert!(c.attach_recv(100 + i).is_ok());
        }
        assert!(c.attach_recv(100).is_ok(), "idempotent");
        assert!(c.attach_recv(999).is_err(), "full");
        assert_eq!(c.recv_channel_count(), MAX_CHANNELS);

        c.detach(10);
        assert_eq!(c.send_channel, 0);
        c.detach(103);
        assert_eq!(c.recv_channel_count(), MAX_CHANNELS - 1);
        assert!(c.attach_recv(999).is_ok());
    }
}
