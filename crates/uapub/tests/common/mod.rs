// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared fixtures for the integration tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uapub::eventloop::DefaultEventLoop;
use uapub::host::{AttributeId, MemoryAddressSpace};
use uapub::protocol::{PublisherId, PROFILE_UDP_UADP};
use uapub::pubsub::*;
use uapub::transport::loopback::LoopbackConnectionManager;
use uapub::transport::{
    ChannelCallback, ChannelEvent, ChannelId, ChannelState, ConnectionManager, ConnectionParams,
};
use uapub::types::{NodeId, StatusCode};

pub struct TestRt {
    pub el: Arc<DefaultEventLoop>,
    pub space: Arc<MemoryAddressSpace>,
    pub manager: PubSubManager,
}

/// Manager + loopback transport + in-memory address space.
pub fn runtime() -> TestRt {
    runtime_with(Vec::new(), PubSubCallbacks::default())
}

pub fn runtime_with(
    extra_transports: Vec<Arc<dyn ConnectionManager>>,
    callbacks: PubSubCallbacks,
) -> TestRt {
    let el = Arc::new(DefaultEventLoop::new());
    let space = Arc::new(MemoryAddressSpace::new());
    let loopback = Arc::new(LoopbackConnectionManager::new());
    el.register_connection_manager(loopback.clone());

    let mut builder = PubSubManager::builder()
        .event_loop(el.clone())
        .host(space.clone())
        .callbacks(callbacks)
        .transport(loopback);
    for cm in extra_transports {
        el.register_connection_manager(cm.clone());
        builder = builder.transport(cm);
    }
    let manager = builder.build().expect("build manager");
    TestRt { el, space, manager }
}

/// Run a few loop iterations to flush channel events and timers.
pub fn settle(el: &DefaultEventLoop) {
    for _ in 0..10 {
        el.run_iterate(Duration::from_millis(1));
    }
}

pub fn connection_cfg(name: &str, publisher_id: PublisherId) -> PubSubConnectionConfig {
    PubSubConnectionConfig {
        name: name.into(),
        publisher_id: Some(publisher_id),
        transport_profile_uri: PROFILE_UDP_UADP.into(),
        address: NetworkAddressUrl {
            network_interface: String::new(),
            url: "opc.udp://224.0.0.22:4840/".into(),
        },
        ..Default::default()
    }
}

pub fn field_cfg(source: &NodeId, alias: &str) -> DataSetFieldConfig {
    DataSetFieldConfig {
        field_name_alias: alias.into(),
        publish_parameters: PublishedVariable {
            published_variable: source.clone(),
            attribute_id: AttributeId::Value,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Reader metadata matching one Double source field.
pub fn reader_cfg(
    name: &str,
    publisher_id: PublisherId,
    writer_group_id: u16,
    dataset_writer_id: u16,
    target: &NodeId,
) -> DataSetReaderConfig {
    use uapub::protocol::{DataSetMetaData, FieldMetaData};
    DataSetReaderConfig {
        name: name.into(),
        publisher_id,
        writer_group_id,
        dataset_writer_id,
        dataset_metadata: DataSetMetaData {
            name: name.into(),
            fields: vec![FieldMetaData {
                name: "value".into(),
                built_in_type: uapub::types::BuiltInType::Double as u8,
                value_rank: -1,
                ..Default::default()
            }],
            ..Default::default()
        },
        target_variables: vec![FieldTarget {
            target_node_id: target.clone(),
            attribute_id: AttributeId::Value,
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Records every buffer handed to the transport; poses as the "udp" driver.
#[derive(Default)]
pub struct CaptureConnectionManager {
    pub sent: Mutex<Vec<Vec<u8>>>,
    inner: Mutex<CaptureInner>,
}

#[derive(Default)]
struct CaptureInner {
    channels: Vec<(ChannelId, bool, ChannelCallback)>,
    pending: Vec<(ChannelId, ChannelState, bool, ChannelCallback)>,
    next_id: ChannelId,
}

impl CaptureConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }
}

impl ConnectionManager for CaptureConnectionManager {
    fn protocol(&self) -> &'static str {
        "udp"
    }

    fn open_connection(
        &self,
        params: &ConnectionParams,
        callback: ChannelCallback,
    ) -> uapub::Result<()> {
        if params.validate {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.channels.push((id, params.listen, callback.clone()));
        inner.pending.push((id, ChannelState::Established, params.listen, callback));
        Ok(())
    }

    fn send_with_connection(&self, _id: ChannelId, buf: Vec<u8>) -> uapub::Result<()> {
        self.sent.lock().push(buf);
        Ok(())
    }

    fn close_connection(&self, id: ChannelId) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.channels.iter().position(|(cid, _, _)| *cid == id) {
            let (_, recv, cb) = inner.channels.remove(pos);
            inner.pending.push((id, ChannelState::Closing, recv, cb));
        }
    }

    fn process_events(&self, _timeout: Duration) {
        loop {
            let item = {
                let mut inner = self.inner.lock();
                if inner.pending.is_empty() {
                    break;
                }
                inner.pending.remove(0)
            };
            let (id, state, recv, cb) = item;
            cb(&ChannelEvent { channel: id, state, recv, bytes: &[] });
        }
    }
}

/// Collects (component, state, reason) notifications.
pub type StateLog = Arc<Mutex<Vec<(NodeId, PubSubState, StatusCode)>>>;

pub fn state_logging_callbacks() -> (PubSubCallbacks, StateLog) {
    let log: StateLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let callbacks = PubSubCallbacks {
        state_change: Some(Arc::new(move |node, state, reason| {
            sink.lock().push((node.clone(), state, reason));
        })),
        ..Default::default()
    };
    (callbacks, log)
}

