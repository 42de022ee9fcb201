// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Endpoint URL parsing.
//!
//! Supported forms:
//! - `opc.udp://host:port` (default port 4840)
//! - `opc.tcp://host:port/path`
//! - `opc.mqtt://host:port` / `mqtt://host:port` (default port 1883)
//! - `opc.eth://mac[:vid[.pcp]]` where mac is `aa-bb-cc-dd-ee-ff` or a
//!   broadcast/interface name
//!
//! Hostnames may be bracketed IPv6 literals. For UDP an empty hostname or
//! the literal `localhost` means "receive all": bind to any address and do
//! not filter by source.

use crate::types::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlScheme {
    OpcUdp,
    OpcTcp,
    OpcMqtt,
    OpcEth,
}

impl UrlScheme {
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            UrlScheme::OpcUdp | UrlScheme::OpcTcp => 4840,
            UrlScheme::OpcMqtt => 1883,
            UrlScheme::OpcEth => 0,
        }
    }
}

/// Parsed endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub scheme: UrlScheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Ethernet VLAN id (opc.eth only).
    pub vid: Option<u16>,
    /// Ethernet priority code point (opc.eth only).
    pub pcp: Option<u8>,
}

impl NetworkAddress {
    /// "Receive all" wildcard: bind to any, no source filtering.
    #[must_use]
    pub fn is_receive_all(&self) -> bool {
        self.host.is_empty() || self.host == "localhost"
    }

    /// True for IPv4/IPv6 multicast group addresses.
    #[must_use]
    pub fn is_multicast(&self) -> bool {
        if let Ok(v4) = self.host.parse::<std::net::Ipv4Addr>() {
            return v4.is_multicast();
        }
        if let Ok(v6) = self.host.parse::<std::net::Ipv6Addr>() {
            return v6.is_multicast();
        }
        false
    }
}

/// Parse an endpoint URL. Returns `BadInvalidArgument` on malformed input.
pub fn parse_url(url: &str) -> crate::Result<NetworkAddress> {
    let (scheme, rest) = if let Some(rest) = url.strip_prefix("opc.udp://") {
        (UrlScheme::OpcUdp, rest)
    } else if let Some(rest) = url.strip_prefix("opc.tcp://") {
        (UrlScheme::OpcTcp, rest)
    } else if let Some(rest) = url.strip_prefix("opc.mqtt://") {
        (UrlScheme::OpcMqtt, rest)
    } else if let Some(rest) = url.strip_prefix("mqtt://") {
        (UrlScheme::OpcMqtt, rest)
    } else if let Some(rest) = url.strip_prefix("opc.eth://") {
        (UrlScheme::OpcEth, rest)
    } else {
        return Err(StatusCode::BAD_INVALID_ARGUMENT);
    };

    if scheme == UrlScheme::OpcEth {
        return parse_eth(rest);
    }

    let (hostport, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, String::new()),
    };

    let (host, port) = split_host_port(hostport)?;
    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| StatusCode::BAD_INVALID_ARGUMENT)?,
        None => scheme.default_port(),
    };

    Ok(NetworkAddress { scheme, host, port, path, vid: None, pcp: None })
}

/// `mac[:vid[.pcp]]`. The mac part is kept verbatim (it may be an interface
/// name or `ff-ff-ff-ff-ff-ff`).
fn parse_eth(rest: &str) -> crate::Result<NetworkAddress> {
    if rest.is_empty() {
        return Err(StatusCode::BAD_INVALID_ARGUMENT);
    }
    let (host, vid, pcp) = match rest.rsplit_once(':') {
        Some((mac, vlan)) if !vlan.is_empty() => {
            let (vid_str, pcp_str) = match vlan.split_once('.') {
                Some((v, p)) => (v, Some(p)),
                None => (vlan, None),
            };
            let vid = vid_str.parse::<u16>().map_err(|_| StatusCode::BAD_INVALID_ARGUMENT)?;
            let pcp = match pcp_str {
                Some(p) => {
                    let p = p.parse::<u8>().map_err(|_| StatusCode::BAD_INVALID_ARGUMENT)?;
                    if p > 7 {
                        return Err(StatusCode::BAD_INVALID_ARGUMENT);
                    }
                    Some(p)
                }
                None => None,
            };
            (mac.to_string(), Some(vid), pcp)
        }
        _ => (rest.to_string(), None, None),
    };
    Ok(NetworkAddress { scheme: UrlScheme::OpcEth, host, port: 0, path: String::new(), vid, pcp })
}

fn split_host_port(hostport: &str) -> crate::Result<(String, Option<&str>)> {
    if let Some(rest) = hostport.strip_prefix('[') {
        // bracketed IPv6: [::1]:4840
        let end = rest.find(']').ok_or(StatusCode::BAD_INVALID_ARGUMENT)?;
        let host = rest[..end].to_string();
        let after = &rest[end + 1..];
        if after.is_empty() {
            return Ok((host, None));
        }
        let port = after.strip_prefix(':').ok_or(StatusCode::BAD_INVALID_ARGUMENT)?;
        return Ok((host, Some(port)));
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), Some(port))),
        None => Ok((hostport.to_string(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_url() {
        let a = parse_url("opc.udp://224.0.0.22:4840/").expect("parse");
        assert_eq!(a.scheme, UrlScheme::OpcUdp);
        assert_eq!(a.host, "224.0.0.22");
        assert_eq!(a.port, 4840);
        assert!(a.is_multicast());
        assert!(!a.is_receive_all());
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(parse_url("opc.udp://10.0.0.1").expect("parse").port, 4840);
        assert_eq!(parse_url("mqtt://broker").expect("parse").port, 1883);
        assert_eq!(parse_url("opc.mqtt://broker:8883").expect("parse").port, 8883);
    }

    #[test]
    fn test_tcp_path() {
        let a = parse_url("opc.tcp://server:4841/ua/endpoint").expect("parse");
        assert_eq!(a.port, 4841);
        assert_eq!(a.path, "/ua/endpoint");
    }

    #[test]
    fn test_ipv6_bracketed() {
        let a = parse_url("opc.udp://[ff02::1]:4840").expect("parse");
        assert_eq!(a.host, "ff02::1");
        assert_eq!(a.port, 4840);
        assert!(a.is_multicast());

        let b = parse_url("opc.udp://[::1]").expect("parse");
        assert_eq!(b.host, "::1");
        assert_eq!(b.port, 4840);
    }

    #[test]
    fn test_receive_all_wildcard() {
        assert!(parse_url("opc.udp://localhost:4840").expect("parse").is_receive_all());
        assert!(parse_url("opc.udp://:4840").expect("parse").is_receive_all());
        assert!(!parse_url("opc.udp://192.168.0.7:4840").expect("parse").is_receive_all());
    }

    #[test]
    fn test_eth_forms() {
        let a = parse_url("opc.eth://ff-ff-ff-ff-ff-ff").expect("parse");
        assert_eq!(a.host, "ff-ff-ff-ff-ff-ff");
        assert_eq!(a.vid, None);

        let b = parse_url("opc.eth://01-00-5e-00-00-01:100.3").expect("parse");
        assert_eq!(b.vid, Some(100));
        assert_eq!(b.pcp, Some(3));

        let c = parse_url("opc.eth://01-00-5e-00-00-01:7").expect("parse");
        assert_eq!(c.vid, Some(7));
        assert_eq!(c.pcp, None);

        assert!(parse_url("opc.eth://mac:100.9").is_err());
    }

    #[test]
    fn test_bad_urls() {
        assert!(parse_url("http://foo").is_err());
        assert!(parse_url("opc.udp://host:notaport").is_err());
        assert!(parse_url("opc.eth://").is_err());
    }
}
