// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UADP NetworkMessage / DataSetMessage model (Part 14 Section 7.2.2).
//!
//! The codec is bit-exact: all integers little-endian, all optional header
//! fields gated by flag bits. Encoding is two-pass ([`encode::calc_size`]
//! computes the exact buffer length, [`encode::encode`] writes in place and
//! optionally records an offset table for realtime in-place updates).

pub mod decode;
pub mod encode;

pub use encode::{OffsetEntry, OffsetKind};

use super::PublisherId;
use crate::types::{DataValue, DateTime, Guid, Variant};

// UADPFlags (byte 0, bits 4-7; bits 0-3 carry the version)
pub(crate) const NM_FLAG_PUBLISHER_ID: u8 = 0x10;
pub(crate) const NM_FLAG_GROUP_HEADER: u8 = 0x20;
pub(crate) const NM_FLAG_PAYLOAD_HEADER: u8 = 0x40;
pub(crate) const NM_FLAG_EXTENDED1: u8 = 0x80;

// ExtendedFlags1 (bits 0-2: PublisherId type)
pub(crate) const EXT1_DATASET_CLASS_ID: u8 = 0x08;
pub(crate) const EXT1_SECURITY: u8 = 0x10;
pub(crate) const EXT1_TIMESTAMP: u8 = 0x20;
pub(crate) const EXT1_PICOSECONDS: u8 = 0x40;
pub(crate) const EXT1_EXTENDED2: u8 = 0x80;

// ExtendedFlags2
pub(crate) const EXT2_CHUNK: u8 = 0x01;
pub(crate) const EXT2_PROMOTED_FIELDS: u8 = 0x02;

// GroupFlags
pub(crate) const GROUP_FLAG_WRITER_GROUP_ID: u8 = 0x01;
pub(crate) const GROUP_FLAG_GROUP_VERSION: u8 = 0x02;
pub(crate) const GROUP_FLAG_NM_NUMBER: u8 = 0x04;
pub(crate) const GROUP_FLAG_SEQUENCE_NUMBER: u8 = 0x08;

// SecurityFlags
pub(crate) const SEC_FLAG_SIGNED: u8 = 0x01;
pub(crate) const SEC_FLAG_ENCRYPTED: u8 = 0x02;
pub(crate) const SEC_FLAG_FOOTER: u8 = 0x04;
pub(crate) const SEC_FLAG_KEY_RESET: u8 = 0x08;

// DataSetFlags1
pub(crate) const DSM_FLAG_VALID: u8 = 0x01;
pub(crate) const DSM_FLAG_SEQUENCE_NUMBER: u8 = 0x08;
pub(crate) const DSM_FLAG_STATUS: u8 = 0x10;
pub(crate) const DSM_FLAG_CFG_MAJOR: u8 = 0x20;
pub(crate) const DSM_FLAG_CFG_MINOR: u8 = 0x40;
pub(crate) const DSM_FLAG_FLAGS2: u8 = 0x80;

// DataSetFlags2
pub(crate) const DSM2_TIMESTAMP: u8 = 0x10;
pub(crate) const DSM2_PICOSECONDS: u8 = 0x20;

/// Field encoding of a DataSetMessage payload (DataSetFlags1 bits 1-2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FieldEncoding {
    #[default]
    Variant = 0,
    RawData = 1,
    DataValue = 2,
}

impl FieldEncoding {
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(FieldEncoding::Variant),
            1 => Some(FieldEncoding::RawData),
            2 => Some(FieldEncoding::DataValue),
            _ => None,
        }
    }
}

/// DataSetMessage type (DataSetFlags2 bits 0-3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DataSetMessageType {
    #[default]
    KeyFrame = 0,
    DeltaFrame = 1,
    Event = 2,
    KeepAlive = 3,
}

impl DataSetMessageType {
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(DataSetMessageType::KeyFrame),
            1 => Some(DataSetMessageType::DeltaFrame),
            2 => Some(DataSetMessageType::Event),
            3 => Some(DataSetMessageType::KeepAlive),
            _ => None,
        }
    }
}

/// Optional group header fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupHeader {
    pub writer_group_id_enabled: bool,
    pub group_version_enabled: bool,
    pub network_message_number_enabled: bool,
    pub sequence_number_enabled: bool,
    pub writer_group_id: u16,
    pub group_version: u32,
    pub network_message_number: u16,
    pub sequence_number: u16,
}

/// Security header carried when signing/encryption is on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecurityHeader {
    pub message_signed: bool,
    pub message_encrypted: bool,
    pub footer_enabled: bool,
    pub force_key_reset: bool,
    pub token_id: u32,
    pub nonce: Vec<u8>,
}

/// Header of one DataSetMessage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSetMessageHeader {
    pub valid: bool,
    pub field_encoding: FieldEncoding,
    pub message_type: DataSetMessageType,
    pub sequence_number_enabled: bool,
    pub sequence_number: u16,
    pub timestamp_enabled: bool,
    pub timestamp: DateTime,
    pub picoseconds_enabled: bool,
    pub picoseconds: u16,
    pub status_enabled: bool,
    /// High 16 bits of the StatusCode.
    pub status: u16,
    pub config_version_major_enabled: bool,
    pub config_version_major: u32,
    pub config_version_minor_enabled: bool,
    pub config_version_minor: u32,
}

/// Payload of one DataSetMessage.
///
/// Raw key frames stay undecoded at the codec layer: splitting the blob into
/// fields needs the Reader's metadata (array dimensions, maxStringLength
/// padding), so the Reader does it.
#[derive(Debug, Clone, PartialEq)]
pub enum DataSetPayload {
    KeyFrame(Vec<DataValue>),
    DeltaFrame(Vec<(u16, DataValue)>),
    KeepAlive,
    RawKeyFrame(Vec<u8>),
}

impl Default for DataSetPayload {
    fn default() -> Self {
        DataSetPayload::KeepAlive
    }
}

impl DataSetPayload {
    /// Field count as carried on the wire (0 for keep-alive and raw).
    #[must_use]
    pub fn field_count(&self) -> usize {
        match self {
            DataSetPayload::KeyFrame(f) => f.len(),
            DataSetPayload::DeltaFrame(f) => f.len(),
            DataSetPayload::KeepAlive | DataSetPayload::RawKeyFrame(_) => 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSetMessage {
    pub header: DataSetMessageHeader,
    pub payload: DataSetPayload,
}

impl DataSetMessage {
    /// A keep-alive/heartbeat frame.
    #[must_use]
    pub fn keep_alive(sequence_number: u16) -> Self {
        DataSetMessage {
            header: DataSetMessageHeader {
                valid: true,
                message_type: DataSetMessageType::KeepAlive,
                sequence_number_enabled: true,
                sequence_number,
                ..Default::default()
            },
            payload: DataSetPayload::KeepAlive,
        }
    }
}

/// One UADP NetworkMessage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkMessage {
    pub version: u8,
    pub publisher_id_enabled: bool,
    pub dataset_class_id_enabled: bool,
    pub group_header_enabled: bool,
    pub payload_header_enabled: bool,
    pub timestamp_enabled: bool,
    pub picoseconds_enabled: bool,
    pub promoted_fields_enabled: bool,
    pub security_enabled: bool,
    pub chunk_message: bool,

    pub publisher_id: Option<PublisherId>,
    pub dataset_class_id: Guid,
    pub group_header: GroupHeader,
    /// Payload header: one writer id per DataSetMessage.
    pub dataset_writer_ids: Vec<u16>,
    pub timestamp: DateTime,
    pub picoseconds: u16,
    pub promoted_fields: Vec<Variant>,
    pub security_header: SecurityHeader,
    pub messages: Vec<DataSetMessage>,
}

impl NetworkMessage {
    pub const UADP_VERSION: u8 = 1;

    #[must_use]
    pub fn new() -> Self {
        NetworkMessage { version: Self::UADP_VERSION, ..Default::default() }
    }

    /// Writer id for payload index `i` (payload header present) or `None`.
    #[must_use]
    pub fn writer_id_at(&self, i: usize) -> Option<u16> {
        if self.payload_header_enabled {
            self.dataset_writer_ids.get(i).copied()
        } else {
            None
        }
    }
}
