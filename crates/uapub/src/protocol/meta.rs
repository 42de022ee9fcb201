// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DataSet metadata (Part 14 Section 6.2.3).
//!
//! The metadata describes the field layout of a published DataSet. Writers
//! derive it from the address space when fields are added; readers configure
//! it to decode raw-framed payloads.

use crate::types::{BuiltInType, Guid, KeyValuePair, LocalizedText, NodeId};

/// FieldFlags bit: the field is promoted into the NetworkMessage header.
pub const FIELD_FLAG_PROMOTED: u16 = 0x0001;

/// Configuration version: seconds-since-2000 stamps for major/minor changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigurationVersion {
    pub major: u32,
    pub minor: u32,
}

/// Metadata of one DataSet field.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldMetaData {
    pub name: String,
    pub description: LocalizedText,
    pub field_flags: u16,
    /// Built-in type tag (0 when the type is not a built-in).
    pub built_in_type: u8,
    pub data_type: NodeId,
    /// -1 scalar, >= 1 array rank.
    pub value_rank: i32,
    pub array_dimensions: Vec<u32>,
    /// Fixed framing budget for String/ByteString raw fields (0 = unlimited).
    pub max_string_length: u32,
    pub dataset_field_id: Guid,
    pub properties: Vec<KeyValuePair>,
}

impl FieldMetaData {
    #[must_use]
    pub fn is_promoted(&self) -> bool {
        self.field_flags & FIELD_FLAG_PROMOTED != 0
    }

    #[must_use]
    pub fn built_in(&self) -> Option<BuiltInType> {
        BuiltInType::from_u8(self.built_in_type)
    }
}

/// Metadata of a whole DataSet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataSetMetaData {
    pub name: String,
    pub description: LocalizedText,
    pub fields: Vec<FieldMetaData>,
    pub dataset_class_id: Guid,
    pub configuration_version: ConfigurationVersion,
}

/// Field layout of one DataSetWriter, keyed by its writer id. The codec
/// resolves the layout for each payload from the NetworkMessage writer-id
/// list.
#[derive(Debug, Clone, Default)]
pub struct EncodingMetaData {
    pub dataset_writer_id: u16,
    pub fields: Vec<FieldMetaData>,
}

/// Find the layout for a writer id.
#[must_use]
pub fn find_meta(meta: &[EncodingMetaData], dataset_writer_id: u16) -> Option<&EncodingMetaData> {
    meta.iter().find(|m| m.dataset_writer_id == dataset_writer_id)
}
