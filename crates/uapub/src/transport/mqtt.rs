// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal MQTT 3.1.1 transport for broker-based PubSub.
//!
//! One TCP session per channel: publish channels CONNECT and PUBLISH
//! (QoS 0) to their topic, subscribe channels CONNECT and SUBSCRIBE and
//! deliver matching PUBLISH payloads. The `Established` callback fires only
//! after CONNACK (and SUBACK for subscribers), so a channel is usable the
//! moment it is attached.

use super::{
    ChannelCallback, ChannelEvent, ChannelId, ChannelState, ConnectionManager, ConnectionParams,
};
use crate::types::StatusCode;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

const KEEP_ALIVE_SECS: u16 = 30;

// Packet types (bits 4-7 of the fixed header).
const PKT_CONNECT: u8 = 0x10;
const PKT_CONNACK: u8 = 0x20;
const PKT_PUBLISH: u8 = 0x30;
const PKT_SUBSCRIBE: u8 = 0x82; // with required flag bits
const PKT_SUBACK: u8 = 0x90;
const PKT_PINGREQ: u8 = 0xC0;
const PKT_PINGRESP: u8 = 0xD0;
const PKT_DISCONNECT: u8 = 0xE0;

// ============================================================================
// Packet codec
// ============================================================================

fn put_remaining_length(out: &mut Vec<u8>, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Returns (length, header bytes consumed) or None if incomplete.
fn get_remaining_length(buf: &[u8]) -> Option<(usize, usize)> {
    let mut len = 0usize;
    let mut shift = 0;
    for (i, byte) in buf.iter().enumerate().take(4) {
        len |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            return Some((len, i + 1));
        }
        shift += 7;
    }
    None
}

fn put_utf8(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode_connect(client_id: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(16 + client_id.len());
    put_utf8(&mut body, "MQTT");
    body.push(0x04); // protocol level 3.1.1
    body.push(0x02); // clean session
    body.extend_from_slice(&KEEP_ALIVE_SECS.to_be_bytes());
    put_utf8(&mut body, client_id);

    let mut pkt = vec![PKT_CONNECT];
    put_remaining_length(&mut pkt, body.len());
    pkt.extend_from_slice(&body);
    pkt
}

fn encode_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + topic.len() + payload.len());
    put_utf8(&mut body, topic);
    body.extend_from_slice(payload); // QoS 0: no packet id

    let mut pkt = vec![PKT_PUBLISH];
    put_remaining_length(&mut pkt, body.len());
    pkt.extend_from_slice(&body);
    pkt
}

fn encode_subscribe(packet_id: u16, topic: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(5 + topic.len());
    body.extend_from_slice(&packet_id.to_be_bytes());
    put_utf8(&mut body, topic);
    body.push(0x00); // requested QoS 0

    let mut pkt = vec![PKT_SUBSCRIBE];
    put_remaining_length(&mut pkt, body.len());
    pkt.extend_from_slice(&body);
    pkt
}

fn encode_pingreq() -> Vec<u8> {
    vec![PKT_PINGREQ, 0]
}

fn encode_disconnect() -> Vec<u8> {
    vec![PKT_DISCONNECT, 0]
}

/// Parse the topic and payload of an inbound PUBLISH body.
fn parse_publish(flags: u8, body: &[u8]) -> Option<(String, &[u8])> {
    if body.len() < 2 {
        return None;
    }
    let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
    let mut pos = 2 + topic_len;
    if body.len() < pos {
        return None;
    }
    let topic = String::from_utf8(body[2..pos].to_vec()).ok()?;
    let qos = (flags >> 1) & 0x03;
    if qos > 0 {
        // packet id present for QoS 1/2 deliveries
        if body.len() < pos + 2 {
            return None;
        }
        pos += 2;
    }
    Some((topic, &body[pos..]))
}

// ============================================================================
// Connection manager
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitConnack,
    AwaitSuback,
    Ready,
}

struct MqttChannel {
    stream: mio::net::TcpStream,
    state: SessionState,
    subscribe: bool,
    topic: String,
    rx: Vec<u8>,
    tx: VecDeque<Vec<u8>>,
    callback: ChannelCallback,
    last_send: Instant,
}

#[derive(Default)]
struct Inner {
    channels: HashMap<ChannelId, MqttChannel>,
    pending: Vec<(ChannelId, ChannelState)>,
    next_id: ChannelId,
}

/// MQTT [`ConnectionManager`].
pub struct MqttConnectionManager {
    inner: Mutex<Inner>,
    poll: Mutex<Poll>,
}

impl MqttConnectionManager {
    pub fn new() -> crate::Result<Self> {
        let poll = Poll::new().map_err(|_| StatusCode::BAD_RESOURCE_UNAVAILABLE)?;
        Ok(MqttConnectionManager { inner: Mutex::new(Inner::default()), poll: Mutex::new(poll) })
    }

    fn resolve(address: &str, port: u16) -> crate::Result<SocketAddr> {
        (address, port)
            .to_socket_addrs()
            .map_err(|_| StatusCode::BAD_INVALID_ARGUMENT)?
            .next()
            .ok_or(StatusCode::BAD_NOT_FOUND)
    }

    fn queue_write(ch: &mut MqttChannel, pkt: Vec<u8>) {
        ch.tx.push_back(pkt);
        ch.last_send = Instant::now();
    }

    fn flush(ch: &mut MqttChannel) -> bool {
        while let Some(front) = ch.tx.front_mut() {
            match ch.stream.write(front) {
                Ok(n) if n == front.len() => {
                    ch.tx.pop_front();
                }
                Ok(n) => {
                    front.drain(..n);
                    return true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(_) => return false,
            }
        }
        true
    }

    /// Parse complete frames out of the channel rx buffer. Returns delivered
    /// payloads and whether the session just became Ready.
    fn drain_frames(ch: &mut MqttChannel) -> (Vec<Vec<u8>>, bool, bool) {
        let mut payloads = Vec::new();
        let mut became_ready = false;
        loop {
            if ch.rx.len() < 2 {
                break;
            }
            let Some((len, header)) = get_remaining_length(&ch.rx[1..]) else { break };
            let total = 1 + header + len;
            if ch.rx.len() < total {
                break;
            }
            let packet_type = ch.rx[0] & 0xF0;
            let flags = ch.rx[0] & 0x0F;
            let body: Vec<u8> = ch.rx[1 + header..total].to_vec();
            ch.rx.drain(..total);

            match packet_type {
                PKT_CONNACK => {
                    if body.len() != 2 || body[1] != 0 {
                        return (payloads, became_ready, false);
                    }
                    if ch.subscribe {
                        let pkt = encode_subscribe(1, &ch.topic.clone());
                        Self::queue_write(ch, pkt);
                        ch.state = SessionState::AwaitSuback;
                    } else {
                        ch.state = SessionState::Ready;
                        became_ready = true;
                    }
                }
                PKT_SUBACK => {
                    // body: packet id + return code
                    if body.len() < 3 || body[2] == 0x80 {
                        return (payloads, became_ready, false);
                    }
                    ch.state = SessionState::Ready;
                    became_ready = true;
                }
                PKT_PUBLISH => {
                    if let Some((topic, payload)) = parse_publish(flags, &body) {
                        if topic == ch.topic {
                            payloads.push(payload.to_vec());
                        }
                    }
                }
                PKT_PINGRESP => {}
                _ => {}
            }
        }
        (payloads, became_ready, true)
    }
}

impl ConnectionManager for MqttConnectionManager {
    fn protocol(&self) -> &'static str {
        "mqtt"
    }

    fn open_connection(
        &self,
        params: &ConnectionParams,
        callback: ChannelCallback,
    ) -> crate::Result<()> {
        let addr = Self::resolve(&params.address, params.port)?;
        let topic = params.topic.clone().ok_or(StatusCode::BAD_INVALID_ARGUMENT)?;
        if topic.is_empty() {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        if params.validate {
            return Ok(());
        }

        let mut stream = mio::net::TcpStream::connect(addr)
            .map_err(|_| StatusCode::BAD_CONNECTION_REJECTED)?;

        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        self.poll
            .lock()
            .registry()
            .register(
                &mut stream,
                Token(id as usize),
                Interest::READABLE | Interest::WRITABLE,
            )
            .map_err(|_| StatusCode::BAD_INTERNAL_ERROR)?;

        let mut ch = MqttChannel {
            stream,
            state: SessionState::AwaitConnack,
            subscribe: params.subscribe,
            topic,
            rx: Vec::new(),
            tx: VecDeque::new(),
            callback,
            last_send: Instant::now(),
        };
        Self::queue_write(&mut ch, encode_connect(&format!("uapub-{}", id)));
        log::info!(
            "[MQTT] open {} channel {} ({}:{} topic '{}')",
            if params.subscribe { "subscribe" } else { "publish" },
            id,
            params.address,
            params.port,
            ch.topic
        );
        inner.channels.insert(id, ch);
        Ok(())
    }

    fn send_with_connection(&self, id: ChannelId, buf: Vec<u8>) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        let ch = inner.channels.get_mut(&id).ok_or(StatusCode::BAD_CONNECTION_CLOSED)?;
        if ch.state != SessionState::Ready {
            return Err(StatusCode::BAD_NO_COMMUNICATION);
        }
        let pkt = encode_publish(&ch.topic.clone(), &buf);
        Self::queue_write(ch, pkt);
        if !Self::flush(ch) {
            return Err(StatusCode::BAD_COMMUNICATION_ERROR);
        }
        Ok(())
    }

    fn close_connection(&self, id: ChannelId) {
        let mut inner = self.inner.lock();
        if let Some(ch) = inner.channels.get_mut(&id) {
            let pkt = encode_disconnect();
            Self::queue_write(ch, pkt);
            let _ = Self::flush(ch);
            let _ = self.poll.lock().registry().deregister(&mut ch.stream);
            inner.pending.push((id, ChannelState::Closing));
        }
    }

    fn process_events(&self, timeout: Duration) {
        // Deferred Closing notifications.
        loop {
            let item = {
                let mut inner = self.inner.lock();
                if inner.pending.is_empty() {
                    break;
                }
                inner.pending.remove(0)
            };
            let (id, state) = item;
            let entry = {
                let mut inner = self.inner.lock();
                if state == ChannelState::Closing {
                    inner.channels.remove(&id).map(|ch| (ch.callback.clone(), ch.subscribe))
                } else {
                    inner.channels.get(&id).map(|ch| (ch.callback.clone(), ch.subscribe))
                }
            };
            if let Some((cb, recv)) = entry {
                cb(&ChannelEvent { channel: id, state, recv, bytes: &[] });
            }
        }

        let mut events = Events::with_capacity(32);
        {
            let mut poll = self.poll.lock();
            if poll.poll(&mut events, Some(timeout)).is_err() {
                return;
            }
        }

        let mut read_buf = [0u8; 16_384];
        for event in events.iter() {
            let id = event.token().0 as ChannelId;

            let mut deliveries: Vec<Vec<u8>> = Vec::new();
            let mut became_ready = false;
            let mut failed = false;
            let (callback, recv) = {
                let mut inner = self.inner.lock();
                let Some(ch) = inner.channels.get_mut(&id) else { continue };

                if event.is_writable() && !Self::flush(ch) {
                    failed = true;
                }
                if event.is_readable() && !failed {
                    loop {
                        match ch.stream.read(&mut read_buf) {
                            Ok(0) => {
                                failed = true;
                                break;
                            }
                            Ok(n) => ch.rx.extend_from_slice(&read_buf[..n]),
                            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                            Err(_) => {
                                failed = true;
                                break;
                            }
                        }
                    }
                    if !failed {
                        let (payloads, ready, ok) = Self::drain_frames(ch);
                        deliveries = payloads;
                        became_ready = ready;
                        failed = !ok;
                        if !failed && !Self::flush(ch) {
                            failed = true;
                        }
                    }
                }
                (ch.callback.clone(), ch.subscribe)
            };

            if failed {
                log::warn!("[MQTT] session failure on channel {}", id);
                self.close_connection(id);
                continue;
            }
            if became_ready {
                callback(&ChannelEvent {
                    channel: id,
                    state: ChannelState::Established,
                    recv,
                    bytes: &[],
                });
            }
            for payload in deliveries {
                callback(&ChannelEvent {
                    channel: id,
                    state: ChannelState::Established,
                    recv: true,
                    bytes: &payload,
                });
            }
        }

        // Keep the sessions alive.
        let pings: Vec<ChannelId> = {
            let inner = self.inner.lock();
            inner
                .channels
                .iter()
                .filter(|(_, ch)| {
                    ch.state == SessionState::Ready
                        && ch.last_send.elapsed().as_secs() >= KEEP_ALIVE_SECS as u64 / 2
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for id in pings {
            let mut inner = self.inner.lock();
            if let Some(ch) = inner.channels.get_mut(&id) {
                Self::queue_write(ch, encode_pingreq());
                let _ = Self::flush(ch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_length_roundtrip() {
        for len in [0usize, 1, 127, 128, 16_383, 16_384, 2_097_151] {
            let mut buf = Vec::new();
            put_remaining_length(&mut buf, len);
            let (decoded, consumed) = get_remaining_length(&buf).expect("decode");
            assert_eq!(decoded, len);
            assert_eq!(consumed, buf.len());
        }
        // incomplete varint
        assert!(get_remaining_length(&[0x80]).is_none());
    }

    #[test]
    fn test_connect_packet() {
        let pkt = encode_connect("uapub-1");
        assert_eq!(pkt[0], PKT_CONNECT);
        // protocol name "MQTT" at offset 2 (2-byte length prefix at 2..4)
        assert_eq!(&pkt[4..8], b"MQTT");
        assert_eq!(pkt[8], 0x04);
    }

    #[test]
    fn test_publish_roundtrip() {
        let pkt = encode_publish("plant/line1", b"payload");
        assert_eq!(pkt[0] & 0xF0, PKT_PUBLISH);
        let (len, header) = get_remaining_length(&pkt[1..]).expect("len");
        let body = &pkt[1 + header..1 + header + len];
        let (topic, payload) = parse_publish(0, body).expect("parse");
        assert_eq!(topic, "plant/line1");
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_publish_qos1_skips_packet_id() {
        // topic "t", packet id 0x0001, payload "x"
        let mut body = Vec::new();
        body.extend_from_slice(&1u16.to_be_bytes());
        body.push(b't');
        body.extend_from_slice(&1u16.to_be_bytes());
        body.push(b'x');
        let (topic, payload) = parse_publish(0x02, &body).expect("parse");
        assert_eq!(topic, "t");
        assert_eq!(payload, b"x");
    }

    #[test]
    fn test_subscribe_packet() {
        let pkt = encode_subscribe(7, "a/b");
        assert_eq!(pkt[0], PKT_SUBSCRIBE);
        let (_, header) = get_remaining_length(&pkt[1..]).expect("len");
        let body = &pkt[1 + header..];
        assert_eq!(u16::from_be_bytes([body[0], body[1]]), 7);
        assert_eq!(&body[4..7], b"a/b");
        assert_eq!(*body.last().expect("qos"), 0);
    }
}
