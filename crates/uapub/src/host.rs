// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Host address-space seam.
//!
//! The PubSub runtime reads published values and writes received values
//! through the host OPC UA server. [`HostServices`] is that boundary; the
//! node-management calls are only exercised by the optional information
//! model. [`MemoryAddressSpace`] is a plain in-memory implementation for
//! embedding the runtime without a full server (and for the test suite).

use crate::types::{DataValue, NodeId, QualifiedName, StatusCode, Variant};
use parking_lot::Mutex;
use std::collections::HashMap;

/// OPC UA attribute ids (Part 3); only Value is routinely used by PubSub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AttributeId {
    NodeId = 1,
    BrowseName = 3,
    DisplayName = 4,
    Value = 13,
}

impl Default for AttributeId {
    fn default() -> Self {
        AttributeId::Value
    }
}

impl AttributeId {
    #[must_use]
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(AttributeId::NodeId),
            3 => Some(AttributeId::BrowseName),
            4 => Some(AttributeId::DisplayName),
            13 => Some(AttributeId::Value),
            _ => None,
        }
    }
}

/// Node class for the information-model surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    Object,
    Variable,
}

/// Services the PubSub runtime consumes from the host server.
///
/// Implementations must be callable from the event-loop thread; the runtime
/// holds its own lock while calling in.
pub trait HostServices: Send + Sync {
    /// Read an attribute. Failures are reported in the DataValue status.
    fn read(&self, node: &NodeId, attribute: AttributeId, index_range: Option<&str>) -> DataValue;

    /// Write an attribute.
    fn write(
        &self,
        node: &NodeId,
        attribute: AttributeId,
        index_range: Option<&str>,
        value: DataValue,
    ) -> StatusCode;

    /// Add a node for the information-model representation.
    fn add_node(
        &self,
        _node: &NodeId,
        _class: NodeClass,
        _parent: &NodeId,
        _browse_name: &QualifiedName,
    ) -> StatusCode {
        StatusCode::BAD_NOT_SUPPORTED
    }

    fn add_reference(&self, _source: &NodeId, _target: &NodeId) -> StatusCode {
        StatusCode::BAD_NOT_SUPPORTED
    }

    fn delete_node(&self, _node: &NodeId) -> StatusCode {
        StatusCode::BAD_NOT_SUPPORTED
    }
}

#[derive(Default)]
struct Node {
    class: NodeClass,
    browse_name: QualifiedName,
    value: DataValue,
    references: Vec<NodeId>,
}

impl Default for NodeClass {
    fn default() -> Self {
        NodeClass::Variable
    }
}

/// In-memory node store.
#[derive(Default)]
pub struct MemoryAddressSpace {
    nodes: Mutex<HashMap<NodeId, Node>>,
}

impl MemoryAddressSpace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a variable node holding `value`.
    pub fn put_variable(&self, node: NodeId, value: Variant) {
        self.nodes.lock().insert(
            node,
            Node {
                class: NodeClass::Variable,
                value: DataValue::from_variant(value),
                ..Default::default()
            },
        );
    }

    /// Current value of a variable, if present.
    #[must_use]
    pub fn value_of(&self, node: &NodeId) -> Option<Variant> {
        self.nodes.lock().get(node).and_then(|n| n.value.value.clone())
    }

    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.lock().contains_key(node)
    }
}

impl HostServices for MemoryAddressSpace {
    fn read(&self, node: &NodeId, attribute: AttributeId, _index_range: Option<&str>) -> DataValue {
        let nodes = self.nodes.lock();
        let Some(n) = nodes.get(node) else {
            return DataValue::bad(StatusCode::BAD_NODE_ID_UNKNOWN);
        };
        match attribute {
            AttributeId::Value => {
                let mut dv = n.value.clone();
                if dv.source_timestamp.is_none() {
                    dv.source_timestamp = Some(crate::types::DateTime::now());
                }
                dv
            }
            AttributeId::BrowseName => {
                DataValue::from_variant(Variant::QualifiedName(n.browse_name.clone()))
            }
            AttributeId::NodeId => DataValue::from_variant(Variant::NodeId(node.clone())),
            AttributeId::DisplayName => DataValue::bad(StatusCode::BAD_ATTRIBUTE_ID_INVALID),
        }
    }

    fn write(
        &self,
        node: &NodeId,
        attribute: AttributeId,
        _index_range: Option<&str>,
        value: DataValue,
    ) -> StatusCode {
        if attribute != AttributeId::Value {
            return StatusCode::BAD_ATTRIBUTE_ID_INVALID;
        }
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(node) {
            Some(n) => {
                n.value = value;
                StatusCode::GOOD
            }
            None => StatusCode::BAD_NODE_ID_UNKNOWN,
        }
    }

    fn add_node(
        &self,
        node: &NodeId,
        class: NodeClass,
        parent: &NodeId,
        browse_name: &QualifiedName,
    ) -> StatusCode {
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(node) {
            return StatusCode::BAD_NODE_ID_EXISTS;
        }
        if let Some(p) = nodes.get_mut(parent) {
            p.references.push(node.clone());
        }
        nodes.insert(
            node.clone(),
            Node { class, browse_name: browse_name.clone(), ..Default::default() },
        );
        StatusCode::GOOD
    }

    fn add_reference(&self, source: &NodeId, target: &NodeId) -> StatusCode {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(source) {
            Some(n) => {
                n.references.push(target.clone());
                StatusCode::GOOD
            }
            None => StatusCode::BAD_NODE_ID_UNKNOWN,
        }
    }

    fn delete_node(&self, node: &NodeId) -> StatusCode {
        let mut nodes = self.nodes.lock();
        if nodes.remove(node).is_some() {
            for n in nodes.values_mut() {
                n.references.retain(|r| r != node);
            }
            StatusCode::GOOD
        } else {
            StatusCode::BAD_NODE_ID_UNKNOWN
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_value() {
        let space = MemoryAddressSpace::new();
        let node = NodeId::numeric(1, 100);
        space.put_variable(node.clone(), Variant::Int32(5));

        let dv = space.read(&node, AttributeId::Value, None);
        assert_eq!(dv.value, Some(Variant::Int32(5)));
        assert!(dv.source_timestamp.is_some());

        let st = space.write(
            &node,
            AttributeId::Value,
            None,
            DataValue::from_variant(Variant::Int32(9)),
        );
        assert_eq!(st, StatusCode::GOOD);
        assert_eq!(space.value_of(&node), Some(Variant::Int32(9)));
    }

    #[test]
    fn test_unknown_node() {
        let space = MemoryAddressSpace::new();
        let dv = space.read(&NodeId::numeric(1, 1), AttributeId::Value, None);
        assert_eq!(dv.status, Some(StatusCode::BAD_NODE_ID_UNKNOWN));
        let st = space.write(&NodeId::numeric(1, 1), AttributeId::Value, None, DataValue::default());
        assert_eq!(st, StatusCode::BAD_NODE_ID_UNKNOWN);
    }

    #[test]
    fn test_node_management() {
        let space = MemoryAddressSpace::new();
        let parent = NodeId::numeric(1, 1);
        let child = NodeId::numeric(1, 2);
        space.put_variable(parent.clone(), Variant::Empty);
        assert_eq!(
            space.add_node(&child, NodeClass::Object, &parent, &QualifiedName::new(1, "c")),
            StatusCode::GOOD
        );
        assert_eq!(
            space.add_node(&child, NodeClass::Object, &parent, &QualifiedName::new(1, "c")),
            StatusCode::BAD_NODE_ID_EXISTS
        );
        assert_eq!(space.delete_node(&child), StatusCode::GOOD);
        assert!(!space.contains(&child));
    }
}
