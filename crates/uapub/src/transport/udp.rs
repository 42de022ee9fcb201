// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP transport: unicast and multicast send/receive channels.
//!
//! Receive channels bind to the wildcard address so packets arrive regardless
//! of the interface. A non-wildcard, non-multicast listen address enables
//! source filtering; a multicast listen address joins the group. Send
//! channels are unbound datagram sockets with a fixed destination.

use super::{
    ChannelCallback, ChannelEvent, ChannelId, ChannelState, ConnectionManager, ConnectionParams,
};
use crate::types::StatusCode;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

const RECV_BUFFER_SIZE: usize = 65_536;

struct UdpChannel {
    socket: mio::net::UdpSocket,
    recv: bool,
    /// Destination for send channels.
    remote: Option<SocketAddr>,
    /// Accept only datagrams from this source (recv channels).
    source_filter: Option<IpAddr>,
    callback: ChannelCallback,
}

#[derive(Default)]
struct Inner {
    channels: HashMap<ChannelId, UdpChannel>,
    /// Established/Closing notifications queued for the next iteration.
    pending: Vec<(ChannelId, ChannelState)>,
    next_id: ChannelId,
}

/// UDP [`ConnectionManager`].
pub struct UdpConnectionManager {
    inner: Mutex<Inner>,
    poll: Mutex<Poll>,
}

impl UdpConnectionManager {
    pub fn new() -> crate::Result<Self> {
        let poll = Poll::new().map_err(|_| StatusCode::BAD_RESOURCE_UNAVAILABLE)?;
        Ok(UdpConnectionManager { inner: Mutex::new(Inner::default()), poll: Mutex::new(poll) })
    }

    fn resolve(address: &str, port: u16) -> crate::Result<SocketAddr> {
        if let Ok(ip) = address.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        (address, port)
            .to_socket_addrs()
            .map_err(|_| StatusCode::BAD_INVALID_ARGUMENT)?
            .next()
            .ok_or(StatusCode::BAD_NOT_FOUND)
    }

    fn interface_v4(params: &ConnectionParams) -> Ipv4Addr {
        params
            .interface
            .as_deref()
            .and_then(|s| s.parse::<Ipv4Addr>().ok())
            .or_else(|| match local_ip_address::local_ip() {
                Ok(IpAddr::V4(ip)) => Some(ip),
                _ => None,
            })
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    fn open_recv(&self, params: &ConnectionParams) -> crate::Result<mio::net::UdpSocket> {
        let receive_all = params.address.is_empty() || params.address == "localhost";
        let target = if receive_all {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), params.port)
        } else {
            Self::resolve(&params.address, params.port)?
        };

        let domain = if target.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|_| StatusCode::BAD_RESOURCE_UNAVAILABLE)?;
        socket.set_nonblocking(true).map_err(|_| StatusCode::BAD_INTERNAL_ERROR)?;
        if params.reuse {
            socket.set_reuse_address(true).map_err(|_| StatusCode::BAD_INTERNAL_ERROR)?;
            #[cfg(unix)]
            let _ = socket.set_reuse_port(true);
        }

        // Bind the wildcard; filtering happens above the socket.
        let bind = SocketAddr::new(
            if target.is_ipv6() {
                IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
            } else {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            },
            params.port,
        );
        socket.bind(&bind.into()).map_err(|e| {
            log::warn!("[UDP] bind {} failed: {}", bind, e);
            StatusCode::BAD_CONNECTION_REJECTED
        })?;

        match target.ip() {
            IpAddr::V4(v4) if v4.is_multicast() => {
                let iface = Self::interface_v4(params);
                socket
                    .join_multicast_v4(&v4, &iface)
                    .map_err(|_| StatusCode::BAD_CONNECTION_REJECTED)?;
                socket
                    .set_multicast_loop_v4(params.loopback)
                    .map_err(|_| StatusCode::BAD_INTERNAL_ERROR)?;
                log::debug!("[UDP] joined multicast group {} on {}", v4, iface);
            }
            IpAddr::V6(v6) if v6.is_multicast() => {
                socket
                    .join_multicast_v6(&v6, 0)
                    .map_err(|_| StatusCode::BAD_CONNECTION_REJECTED)?;
                let _ = socket.set_multicast_loop_v6(params.loopback);
            }
            _ => {}
        }

        Ok(mio::net::UdpSocket::from_std(socket.into()))
    }

    fn open_send(&self, params: &ConnectionParams) -> crate::Result<(mio::net::UdpSocket, SocketAddr)> {
        let target = Self::resolve(&params.address, params.port)?;
        let domain = if target.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|_| StatusCode::BAD_RESOURCE_UNAVAILABLE)?;
        socket.set_nonblocking(true).map_err(|_| StatusCode::BAD_INTERNAL_ERROR)?;

        if let IpAddr::V4(v4) = target.ip() {
            if v4.is_multicast() {
                let iface = Self::interface_v4(params);
                socket
                    .set_multicast_if_v4(&iface)
                    .map_err(|_| StatusCode::BAD_CONNECTION_REJECTED)?;
                socket
                    .set_multicast_loop_v4(params.loopback)
                    .map_err(|_| StatusCode::BAD_INTERNAL_ERROR)?;
            }
        }

        let bind = SocketAddr::new(
            if target.is_ipv6() {
                IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
            } else {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            },
            0,
        );
        socket.bind(&bind.into()).map_err(|_| StatusCode::BAD_CONNECTION_REJECTED)?;
        Ok((mio::net::UdpSocket::from_std(socket.into()), target))
    }
}

impl ConnectionManager for UdpConnectionManager {
    fn protocol(&self) -> &'static str {
        "udp"
    }

    fn open_connection(
        &self,
        params: &ConnectionParams,
        callback: ChannelCallback,
    ) -> crate::Result<()> {
        // Argument check is identical for validate-only calls.
        let receive_all = params.address.is_empty() || params.address == "localhost";
        if !receive_all {
            Self::resolve(&params.address, params.port)?;
        } else if !params.listen {
            // A send channel needs a concrete destination.
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        if params.validate {
            return Ok(());
        }

        let (mut socket, remote, source_filter) = if params.listen {
            let socket = self.open_recv(params)?;
            let filter = if receive_all {
                None
            } else {
                let target = Self::resolve(&params.address, params.port)?;
                match target.ip() {
                    ip if !ip.is_multicast() => Some(ip),
                    _ => None,
                }
            };
            (socket, None, filter)
        } else {
            let (socket, remote) = self.open_send(params)?;
            (socket, Some(remote), None)
        };

        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;

        if params.listen {
            self.poll
                .lock()
                .registry()
                .register(&mut socket, Token(id as usize), Interest::READABLE)
                .map_err(|_| StatusCode::BAD_INTERNAL_ERROR)?;
        }

        log::info!(
            "[UDP] open {} channel {} ({}:{})",
            if params.listen { "recv" } else { "send" },
            id,
            params.address,
            params.port
        );
        inner.channels.insert(
            id,
            UdpChannel { socket, recv: params.listen, remote, source_filter, callback },
        );
        inner.pending.push((id, ChannelState::Established));
        Ok(())
    }

    fn send_with_connection(&self, id: ChannelId, buf: Vec<u8>) -> crate::Result<()> {
        let inner = self.inner.lock();
        let ch = inner.channels.get(&id).ok_or(StatusCode::BAD_CONNECTION_CLOSED)?;
        let remote = ch.remote.ok_or(StatusCode::BAD_INVALID_ARGUMENT)?;
        match ch.socket.send_to(&buf, remote) {
            Ok(_) => Ok(()),
            // A full send buffer drops the datagram; UDP is best-effort.
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                log::warn!("[UDP] send on channel {} failed: {}", id, e);
                Err(StatusCode::BAD_COMMUNICATION_ERROR)
            }
        }
    }

    fn close_connection(&self, id: ChannelId) {
        let mut inner = self.inner.lock();
        if let Some(ch) = inner.channels.get_mut(&id) {
            if ch.recv {
                let _ = self.poll.lock().registry().deregister(&mut ch.socket);
            }
            inner.pending.push((id, ChannelState::Closing));
        }
    }

    fn process_events(&self, timeout: Duration) {
        // 1. Queued state notifications (deferred from open/close).
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
                    inner.channels.remove(&id).map(|ch| (ch.callback, ch.recv))
                } else {
                    inner.channels.get(&id).map(|ch| (ch.callback.clone(), ch.recv))
                }
            };
            if let Some((cb, recv)) = entry {
                cb(&ChannelEvent { channel: id, state, recv, bytes: &[] });
            }
        }

        // 2. Socket readiness.
        let mut events = Events::with_capacity(64);
        {
            let mut poll = self.poll.lock();
            if poll.poll(&mut events, Some(timeout)).is_err() {
                return;
            }
        }

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        for event in events.iter() {
            let id = event.token().0 as ChannelId;
            loop {
                let recv = {
                    let inner = self.inner.lock();
                    let Some(ch) = inner.channels.get(&id) else { break };
                    match ch.socket.recv_from(&mut buf) {
                        Ok((n, from)) => {
                            if let Some(filter) = ch.source_filter {
                                if from.ip() != filter {
                                    continue;
                                }
                            }
                            Some((ch.callback.clone(), n))
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => None,
                        Err(_) => None,
                    }
                };
                match recv {
                    Some((cb, n)) => {
                        cb(&ChannelEvent {
                            channel: id,
                            state: ChannelState::Established,
                            recv: true,
                            bytes: &buf[..n],
                        });
                    }
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn wait_for(cm: &UdpConnectionManager, mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            cm.process_events(Duration::from_millis(5));
            if check() {
                return true;
            }
        }
        false
    }

    #[test]
    fn test_unicast_roundtrip() {
        let cm = UdpConnectionManager::new().expect("cm");
        let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let channels = Arc::new(Mutex::new(Vec::<(ChannelId, bool)>::new()));

        let r = received.clone();
        let c = channels.clone();
        let cb: ChannelCallback = Arc::new(move |ev: &ChannelEvent| {
            if ev.state == ChannelState::Established && ev.bytes.is_empty() {
                c.lock().push((ev.channel, ev.recv));
            }
            if !ev.bytes.is_empty() {
                r.lock().push(ev.bytes.to_vec());
            }
        });

        let port = 46_311;
        let recv_params = ConnectionParams {
            address: String::new(),
            port,
            listen: true,
            reuse: true,
            ..Default::default()
        };
        cm.open_connection(&recv_params, cb.clone()).expect("open recv");

        let send_params = ConnectionParams {
            address: "127.0.0.1".into(),
            port,
            ..Default::default()
        };
        cm.open_connection(&send_params, cb).expect("open send");

        assert!(wait_for(&cm, || channels.lock().len() == 2));
        let send_id = channels.lock().iter().find(|(_, recv)| !recv).expect("send ch").0;

        cm.send_with_connection(send_id, b"uadp".to_vec()).expect("send");
        assert!(wait_for(&cm, || !received.lock().is_empty()));
        assert_eq!(received.lock()[0], b"uadp");
    }

    #[test]
    fn test_validate_does_not_open() {
        let cm = UdpConnectionManager::new().expect("cm");
        let cb: ChannelCallback = Arc::new(|_ev: &ChannelEvent| {});
        let params = ConnectionParams {
            address: "224.0.0.22".into(),
            port: 4840,
            listen: false,
            validate: true,
            ..Default::default()
        };
        cm.open_connection(&params, cb).expect("validate");
        assert!(cm.inner.lock().channels.is_empty());
    }

    #[test]
    fn test_send_channel_needs_destination() {
        let cm = UdpConnectionManager::new().expect("cm");
        let cb: ChannelCallback = Arc::new(|_ev: &ChannelEvent| {});
        let params = ConnectionParams { address: String::new(), port: 4840, ..Default::default() };
        assert_eq!(
            cm.open_connection(&params, cb),
            Err(StatusCode::BAD_INVALID_ARGUMENT)
        );
    }
}
