// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ethernet L2 transport (AF_PACKET, Linux only).
//!
//! Uses datagram packet sockets so the kernel builds the Ethernet header:
//! send channels target a destination MAC, receive channels accept every
//! frame with the OPC UA UADP EtherType on the bound interface. VLAN
//! tagging (vid/pcp from the opc.eth URL) requires raw-header sockets and
//! is not applied here.

use super::{
    ChannelCallback, ChannelEvent, ChannelId, ChannelState, ConnectionManager, ConnectionParams,
};
use crate::types::StatusCode;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::Duration;

/// EtherType assigned to OPC UA UADP over Ethernet.
pub const ETHERTYPE_UADP: u16 = 0xB62C;

const FRAME_BUFFER_SIZE: usize = 9000;

struct EthChannel {
    fd: RawFd,
    recv: bool,
    ifindex: i32,
    dest: [u8; 6],
    callback: ChannelCallback,
}

impl Drop for EthChannel {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[derive(Default)]
struct Inner {
    channels: HashMap<ChannelId, EthChannel>,
    pending: Vec<(ChannelId, ChannelState)>,
    next_id: ChannelId,
}

/// Ethernet [`ConnectionManager`].
#[derive(Default)]
pub struct EthConnectionManager {
    inner: Mutex<Inner>,
}

impl EthConnectionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// `aa-bb-cc-dd-ee-ff` (also accepts `:` separators).
fn parse_mac(s: &str) -> crate::Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let parts: Vec<&str> = s.split(['-', ':']).collect();
    if parts.len() != 6 {
        return Err(StatusCode::BAD_INVALID_ARGUMENT);
    }
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16).map_err(|_| StatusCode::BAD_INVALID_ARGUMENT)?;
    }
    Ok(mac)
}

fn interface_index(name: &str) -> crate::Result<i32> {
    let c_name = std::ffi::CString::new(name).map_err(|_| StatusCode::BAD_INVALID_ARGUMENT)?;
    let idx = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if idx == 0 {
        return Err(StatusCode::BAD_NOT_FOUND);
    }
    Ok(idx as i32)
}

fn open_packet_socket(ifindex: i32) -> crate::Result<RawFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK,
            (ETHERTYPE_UADP as u16).to_be() as i32,
        )
    };
    if fd < 0 {
        return Err(StatusCode::BAD_RESOURCE_UNAVAILABLE);
    }
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = (ETHERTYPE_UADP as u16).to_be();
    addr.sll_ifindex = ifindex;
    let rc = unsafe {
        libc::bind(
            fd,
            std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        unsafe { libc::close(fd) };
        return Err(StatusCode::BAD_CONNECTION_REJECTED);
    }
    Ok(fd)
}

impl ConnectionManager for EthConnectionManager {
    fn protocol(&self) -> &'static str {
        "eth"
    }

    fn open_connection(
        &self,
        params: &ConnectionParams,
        callback: ChannelCallback,
    ) -> crate::Result<()> {
        let dest = parse_mac(&params.address)?;
        let iface = params.interface.as_deref().ok_or(StatusCode::BAD_INVALID_ARGUMENT)?;
        let ifindex = interface_index(iface)?;
        if params.validate {
            return Ok(());
        }

        let fd = open_packet_socket(ifindex)?;
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        log::info!(
            "[ETH] open {} channel {} ({} on {})",
            if params.listen { "recv" } else { "send" },
            id,
            params.address,
            iface
        );
        inner.channels.insert(
            id,
            EthChannel { fd, recv: params.listen, ifindex, dest, callback },
        );
        inner.pending.push((id, ChannelState::Established));
        Ok(())
    }

    fn send_with_connection(&self, id: ChannelId, buf: Vec<u8>) -> crate::Result<()> {
        let inner = self.inner.lock();
        let ch = inner.channels.get(&id).ok_or(StatusCode::BAD_CONNECTION_CLOSED)?;
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = (ETHERTYPE_UADP as u16).to_be();
        addr.sll_ifindex = ch.ifindex;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&ch.dest);
        let rc = unsafe {
            libc::sendto(
                ch.fd,
                buf.as_ptr().cast(),
                buf.len(),
                0,
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(StatusCode::BAD_COMMUNICATION_ERROR);
        }
        Ok(())
    }

    fn close_connection(&self, id: ChannelId) {
        let mut inner = self.inner.lock();
        if inner.channels.contains_key(&id) {
            inner.pending.push((id, ChannelState::Closing));
        }
    }

    fn process_events(&self, timeout: Duration) {
        // Deferred state notifications.
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
                    inner.channels.remove(&id).map(|ch| (ch.callback.clone(), ch.recv))
                } else {
                    inner.channels.get(&id).map(|ch| (ch.callback.clone(), ch.recv))
                }
            };
            if let Some((cb, recv)) = entry {
                cb(&ChannelEvent { channel: id, state, recv, bytes: &[] });
            }
        }

        // Poll the receive sockets.
        let fds: Vec<(ChannelId, RawFd)> = {
            let inner = self.inner.lock();
            inner.channels.iter().filter(|(_, ch)| ch.recv).map(|(id, ch)| (*id, ch.fd)).collect()
        };
        if fds.is_empty() {
            if !timeout.is_zero() {
                std::thread::sleep(timeout.min(Duration::from_millis(10)));
            }
            return;
        }
        let mut pollfds: Vec<libc::pollfd> = fds
            .iter()
            .map(|(_, fd)| libc::pollfd { fd: *fd, events: libc::POLLIN, revents: 0 })
            .collect();
        let rc = unsafe {
            libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout.as_millis() as i32)
        };
        if rc <= 0 {
            return;
        }

        let mut buf = [0u8; FRAME_BUFFER_SIZE];
        for (i, (id, fd)) in fds.iter().enumerate() {
            if pollfds[i].revents & libc::POLLIN == 0 {
                continue;
            }
            loop {
                let n = unsafe { libc::recv(*fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
                if n <= 0 {
                    break;
                }
                let cb = {
                    let inner = self.inner.lock();
                    inner.channels.get(id).map(|ch| ch.callback.clone())
                };
                if let Some(cb) = cb {
                    cb(&ChannelEvent {
                        channel: *id,
                        state: ChannelState::Established,
                        recv: true,
                        bytes: &buf[..n as usize],
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("01-00-5e-00-00-01").expect("mac"),
            [0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]
        );
        assert_eq!(parse_mac("ff:ff:ff:ff:ff:ff").expect("mac"), [0xFF; 6]);
        assert!(parse_mac("01-00-5e").is_err());
        assert!(parse_mac("zz-00-5e-00-00-01").is_err());
    }

    #[test]
    fn test_open_requires_interface() {
        let cm = EthConnectionManager::new();
        let cb: ChannelCallback = std::sync::Arc::new(|_ev: &ChannelEvent| {});
        let params = ConnectionParams {
            address: "ff-ff-ff-ff-ff-ff".into(),
            ..Default::default()
        };
        assert_eq!(
            cm.open_connection(&params, cb),
            Err(StatusCode::BAD_INVALID_ARGUMENT)
        );
    }
}
