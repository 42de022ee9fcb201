// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire-level protocol support: transport profiles, DataSet metadata and the
//! UADP / JSON NetworkMessage codecs.

pub mod uadp;

#[cfg(feature = "json-encoding")]
pub mod json;

mod meta;

pub use meta::{
    find_meta, ConfigurationVersion, DataSetMetaData, EncodingMetaData, FieldMetaData,
    FIELD_FLAG_PROMOTED,
};

use crate::types::StatusCode;
use std::fmt;

pub const PROFILE_UDP_UADP: &str =
    "http://opcfoundation.org/UA-Profile/Transport/pubsub-udp-uadp";
pub const PROFILE_MQTT_UADP: &str =
    "http://opcfoundation.org/UA-Profile/Transport/pubsub-mqtt-uadp";
pub const PROFILE_MQTT_JSON: &str =
    "http://opcfoundation.org/UA-Profile/Transport/pubsub-mqtt-json";
pub const PROFILE_ETH_UADP: &str =
    "http://opcfoundation.org/UA-Profile/Transport/pubsub-eth-uadp";

/// Most DataSetMessages a single NetworkMessage can carry (u8 count field).
pub const MAX_DSM_COUNT: usize = 255;

/// Longest supported security nonce.
pub const MAX_NONCE_LENGTH: usize = 16;

/// The four supported transport profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProfile {
    UdpUadp,
    MqttUadp,
    MqttJson,
    EthUadp,
}

impl TransportProfile {
    pub fn from_uri(uri: &str) -> crate::Result<Self> {
        match uri {
            PROFILE_UDP_UADP => Ok(TransportProfile::UdpUadp),
            PROFILE_MQTT_UADP => Ok(TransportProfile::MqttUadp),
            PROFILE_MQTT_JSON => Ok(TransportProfile::MqttJson),
            PROFILE_ETH_UADP => Ok(TransportProfile::EthUadp),
            _ => Err(StatusCode::BAD_INVALID_ARGUMENT),
        }
    }

    #[must_use]
    pub fn uri(self) -> &'static str {
        match self {
            TransportProfile::UdpUadp => PROFILE_UDP_UADP,
            TransportProfile::MqttUadp => PROFILE_MQTT_UADP,
            TransportProfile::MqttJson => PROFILE_MQTT_JSON,
            TransportProfile::EthUadp => PROFILE_ETH_UADP,
        }
    }

    /// Protocol name for the ConnectionManager lookup.
    #[must_use]
    pub fn protocol(self) -> &'static str {
        match self {
            TransportProfile::UdpUadp => "udp",
            TransportProfile::MqttUadp | TransportProfile::MqttJson => "mqtt",
            TransportProfile::EthUadp => "eth",
        }
    }

    /// JSON message mapping instead of UADP binary.
    #[must_use]
    pub fn is_json(self) -> bool {
        self == TransportProfile::MqttJson
    }
}

/// Typed identity of a publishing endpoint (spec'd sum type; string ids
/// compare by content, distinct variants never match).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PublisherId {
    Byte(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    String(String),
}

impl Default for PublisherId {
    fn default() -> Self {
        PublisherId::UInt64(0)
    }
}

impl PublisherId {
    /// Wire type bits in ExtendedFlags1 (Part 14 Table 75).
    #[must_use]
    pub fn type_bits(&self) -> u8 {
        match self {
            PublisherId::Byte(_) => 0,
            PublisherId::UInt16(_) => 1,
            PublisherId::UInt32(_) => 2,
            PublisherId::UInt64(_) => 3,
            PublisherId::String(_) => 4,
        }
    }

    /// Identity match: same variant and equal value.
    #[must_use]
    pub fn matches(&self, other: &PublisherId) -> bool {
        self == other
    }
}

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublisherId::Byte(v) => write!(f, "b{}", v),
            PublisherId::UInt16(v) => write!(f, "u16:{}", v),
            PublisherId::UInt32(v) => write!(f, "u32:{}", v),
            PublisherId::UInt64(v) => write!(f, "u64:{}", v),
            PublisherId::String(s) => write!(f, "\"{}\"", s),
        }
    }
}
