// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Variant, DataValue and ExtensionObject value model.

use super::{BuiltInType, DateTime, Guid, LocalizedText, NodeId, QualifiedName, StatusCode};

/// A dynamically typed OPC UA value.
///
/// Scalars carry their value inline; arrays are homogeneous over one built-in
/// type and may carry multi-dimensional array dimensions.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Variant {
    #[default]
    Empty,
    Boolean(bool),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    DateTime(DateTime),
    Guid(Guid),
    ByteString(Vec<u8>),
    StatusCode(StatusCode),
    NodeId(NodeId),
    QualifiedName(QualifiedName),
    LocalizedText(LocalizedText),
    ExtensionObject(Box<ExtensionObject>),
    Array {
        elem: BuiltInType,
        values: Vec<Variant>,
        dimensions: Option<Vec<u32>>,
    },
}

impl Variant {
    /// The built-in type tag of the contained value (element type for arrays).
    #[must_use]
    pub fn built_in_type(&self) -> Option<BuiltInType> {
        Some(match self {
            Variant::Empty => return None,
            Variant::Boolean(_) => BuiltInType::Boolean,
            Variant::SByte(_) => BuiltInType::SByte,
            Variant::Byte(_) => BuiltInType::Byte,
            Variant::Int16(_) => BuiltInType::Int16,
            Variant::UInt16(_) => BuiltInType::UInt16,
            Variant::Int32(_) => BuiltInType::Int32,
            Variant::UInt32(_) => BuiltInType::UInt32,
            Variant::Int64(_) => BuiltInType::Int64,
            Variant::UInt64(_) => BuiltInType::UInt64,
            Variant::Float(_) => BuiltInType::Float,
            Variant::Double(_) => BuiltInType::Double,
            Variant::String(_) => BuiltInType::String,
            Variant::DateTime(_) => BuiltInType::DateTime,
            Variant::Guid(_) => BuiltInType::Guid,
            Variant::ByteString(_) => BuiltInType::ByteString,
            Variant::StatusCode(_) => BuiltInType::StatusCode,
            Variant::NodeId(_) => BuiltInType::NodeId,
            Variant::QualifiedName(_) => BuiltInType::QualifiedName,
            Variant::LocalizedText(_) => BuiltInType::LocalizedText,
            Variant::ExtensionObject(_) => BuiltInType::ExtensionObject,
            Variant::Array { elem, .. } => *elem,
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Variant::Empty)
    }

    #[must_use]
    pub fn is_array(&self) -> bool {
        matches!(self, Variant::Array { .. })
    }

    /// Scalar value rank per the OPC UA convention (-1 scalar, 1.. arrays).
    #[must_use]
    pub fn value_rank(&self) -> i32 {
        match self {
            Variant::Array { dimensions: Some(d), .. } => d.len() as i32,
            Variant::Array { .. } => 1,
            _ => -1,
        }
    }
}

/// Body of an [`ExtensionObject`]; only binary bodies occur on the wire.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ExtensionObjectBody {
    #[default]
    None,
    ByteString(Vec<u8>),
}

/// OPC UA ExtensionObject: a type id plus an encoded body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtensionObject {
    pub type_id: NodeId,
    pub body: ExtensionObjectBody,
}

impl ExtensionObject {
    #[must_use]
    pub fn binary(type_id: NodeId, body: Vec<u8>) -> Self {
        ExtensionObject { type_id, body: ExtensionObjectBody::ByteString(body) }
    }
}

/// OPC UA DataValue: a value plus quality and timestamps.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataValue {
    pub value: Option<Variant>,
    pub status: Option<StatusCode>,
    pub source_timestamp: Option<DateTime>,
    pub server_timestamp: Option<DateTime>,
    pub source_picoseconds: Option<u16>,
    pub server_picoseconds: Option<u16>,
}

impl DataValue {
    #[must_use]
    pub fn from_variant(value: Variant) -> Self {
        DataValue { value: Some(value), ..Default::default() }
    }

    #[must_use]
    pub fn bad(status: StatusCode) -> Self {
        DataValue { status: Some(status), ..Default::default() }
    }

    #[must_use]
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }
}
