// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process transport for intra-host pub/sub and deterministic tests.
//!
//! Channels are grouped by `address:port`; every buffer sent into a group is
//! delivered to all receive channels of the same group on the next event-loop
//! iteration. No sockets, no timing jitter.

use super::{
    ChannelCallback, ChannelEvent, ChannelId, ChannelState, ConnectionManager, ConnectionParams,
};
use crate::types::StatusCode;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

struct Channel {
    recv: bool,
    group: String,
    callback: ChannelCallback,
}

enum Pending {
    State { id: ChannelId, state: ChannelState },
    Data { id: ChannelId, bytes: Vec<u8> },
}

#[derive(Default)]
struct Inner {
    channels: HashMap<ChannelId, Channel>,
    pending: Vec<Pending>,
    next_id: ChannelId,
}

/// Loopback [`ConnectionManager`].
#[derive(Default)]
pub struct LoopbackConnectionManager {
    inner: Mutex<Inner>,
}

impl LoopbackConnectionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live channels (test introspection).
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }
}

impl ConnectionManager for LoopbackConnectionManager {
    fn protocol(&self) -> &'static str {
        "loopback"
    }

    fn open_connection(
        &self,
        params: &ConnectionParams,
        callback: ChannelCallback,
    ) -> crate::Result<()> {
        if params.address.is_empty() {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        if params.validate {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let group = format!("{}:{}", params.address, params.port);
        inner.channels.insert(id, Channel { recv: params.listen, group, callback });
        inner.pending.push(Pending::State { id, state: ChannelState::Established });
        Ok(())
    }

    fn send_with_connection(&self, id: ChannelId, buf: Vec<u8>) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        let group = match inner.channels.get(&id) {
            Some(ch) if !ch.recv => ch.group.clone(),
            Some(_) => return Err(StatusCode::BAD_INVALID_ARGUMENT),
            None => return Err(StatusCode::BAD_CONNECTION_CLOSED),
        };
        let targets: Vec<ChannelId> = inner
            .channels
            .iter()
            .filter(|(_, ch)| ch.recv && ch.group == group)
            .map(|(id, _)| *id)
            .collect();
        for target in targets {
            inner.pending.push(Pending::Data { id: target, bytes: buf.clone() });
        }
        Ok(())
    }

    fn close_connection(&self, id: ChannelId) {
        let mut inner = self.inner.lock();
        if inner.channels.contains_key(&id) {
            inner.pending.push(Pending::State { id, state: ChannelState::Closing });
        }
    }

    fn process_events(&self, _timeout: Duration) {
        loop {
            // Deliver one event at a time: a callback may queue more work.
            let item = {
                let mut inner = self.inner.lock();
                if inner.pending.is_empty() {
                    break;
                }
                inner.pending.remove(0)
            };
            match item {
                Pending::State { id, state } => {
                    let entry = {
                        let mut inner = self.inner.lock();
                        if state == ChannelState::Closing {
                            inner.channels.remove(&id)
                        } else {
                            inner.channels.get(&id).map(|ch| Channel {
                                recv: ch.recv,
                                group: ch.group.clone(),
                                callback: ch.callback.clone(),
                            })
                        }
                    };
                    if let Some(ch) = entry {
                        (ch.callback)(&ChannelEvent { channel: id, state, recv: ch.recv, bytes: &[] });
                    }
                }
                Pending::Data { id, bytes } => {
                    let cb = {
                        let inner = self.inner.lock();
                        inner.channels.get(&id).map(|ch| ch.callback.clone())
                    };
                    if let Some(cb) = cb {
                        cb(&ChannelEvent {
                            channel: id,
                            state: ChannelState::Established,
                            recv: true,
                            bytes: &bytes,
                        });
                    }
                }
            }
        }
    }
}
