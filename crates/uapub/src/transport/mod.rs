// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport abstraction for PubSub connections.
//!
//! A [`ConnectionManager`] owns the sockets of one protocol family and hands
//! out opaque channel ids. The PubSub layer never touches a socket: it opens
//! channels, sends buffers, and receives `(channel, bytes)` callbacks from
//! the event loop thread.
//!
//! Channel lifecycle as seen through the callback:
//!
//! ```text
//! open_connection() --queued--> Opening/Established (recv|send) --...--> Closing
//! ```
//!
//! Callbacks are never invoked from inside `open_connection` or
//! `close_connection`; they are deferred to the next event-loop iteration so
//! the caller can hold its own locks across the call.

pub mod loopback;
pub mod udp;
pub mod url;

#[cfg(all(feature = "eth", target_os = "linux"))]
pub mod eth;
#[cfg(feature = "mqtt")]
pub mod mqtt;

use std::sync::Arc;
use std::time::Duration;

/// Opaque transport channel id. 0 means "no channel".
pub type ChannelId = u64;

/// State signalled through the channel callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// The channel is being set up (e.g. MQTT CONNECT in flight).
    Opening,
    /// The channel is usable.
    Established,
    /// Last callback for this channel; the id is dead afterwards.
    Closing,
}

/// One callback delivery. `bytes` is empty for pure state events.
pub struct ChannelEvent<'a> {
    pub channel: ChannelId,
    pub state: ChannelState,
    /// Receive-channel discriminator: true for recv channels, false for send.
    pub recv: bool,
    pub bytes: &'a [u8],
}

/// Callback invoked on the event-loop thread for channel events.
pub type ChannelCallback = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Parameters for opening a channel. Each transport reads the fields it
/// understands and ignores the rest.
#[derive(Debug, Clone, Default)]
pub struct ConnectionParams {
    /// Hostname, IP address, multicast group or MAC address.
    pub address: String,
    pub port: u16,
    /// Open a receive channel instead of a send channel.
    pub listen: bool,
    /// SO_REUSEADDR on the bound socket.
    pub reuse: bool,
    /// Multicast loopback (receive own datagrams on the same host).
    pub loopback: bool,
    /// Network interface to bind/join on.
    pub interface: Option<String>,
    /// MQTT topic.
    pub topic: Option<String>,
    /// MQTT: subscribe (receive) instead of publish (send).
    pub subscribe: bool,
    /// Check the parameters without opening anything.
    pub validate: bool,
}

/// A transport protocol driver. Implementations are registered with the
/// event loop and looked up by protocol name.
pub trait ConnectionManager: Send + Sync {
    /// Protocol name used for lookup: "udp", "eth", "mqtt".
    fn protocol(&self) -> &'static str;

    /// Open a channel asynchronously. The outcome arrives through `callback`
    /// on the next event-loop iteration. With `params.validate` set, only
    /// argument checking happens and no callback is delivered.
    fn open_connection(&self, params: &ConnectionParams, callback: ChannelCallback)
        -> crate::Result<()>;

    /// Queue a buffer on a send channel.
    fn send_with_connection(&self, id: ChannelId, buf: Vec<u8>) -> crate::Result<()>;

    /// Close a channel. The final `Closing` callback is deferred to the next
    /// event-loop iteration. Unknown ids are ignored.
    fn close_connection(&self, id: ChannelId);

    /// Obtain a send buffer of `len` bytes for the channel.
    fn alloc_network_buffer(&self, _id: ChannelId, len: usize) -> crate::Result<Vec<u8>> {
        Ok(vec![0u8; len])
    }

    /// Return a buffer without sending it.
    fn free_network_buffer(&self, _id: ChannelId, buf: Vec<u8>) {
        drop(buf);
    }

    /// Poll for I/O and deliver pending callbacks. Called from the event
    /// loop with the per-iteration wait budget.
    fn process_events(&self, timeout: Duration);
}
