// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Information-model representation of the PubSub components.
//!
//! When enabled, every component is mirrored as an object under a
//! `PublishSubscribe` folder in the host address space, with property
//! variables for the interesting configuration values and a live `State`
//! readback (updated on every state change). The `PublishingInterval`
//! property of a WriterGroup is writable through
//! [`PubSubManager::write_info_model_property`] and re-registers the publish
//! timer of a running group.

use super::{Psm, PubSubManager, PubSubState};
use crate::host::{AttributeId, NodeClass};
use crate::types::{DataValue, Identifier, NodeId, QualifiedName, StatusCode, Variant};

impl PubSubState {
    /// Wire value of the OPC UA PubSubState enumeration.
    #[must_use]
    pub fn to_wire(self) -> i32 {
        match self {
            PubSubState::Disabled => 0,
            PubSubState::Paused => 1,
            PubSubState::Operational => 2,
            PubSubState::Error => 3,
            PubSubState::PreOperational => 4,
        }
    }
}

fn folder_id() -> NodeId {
    NodeId::string(super::PUBSUB_NAMESPACE, "PublishSubscribe")
}

pub(crate) fn property_id(component: u32, name: &str) -> NodeId {
    NodeId::string(super::PUBSUB_NAMESPACE, format!("{}.{}", component, name))
}

const PROPERTY_NAMES: &[&str] = &[
    "PublisherId",
    "TransportProfileUri",
    "Address",
    "PublishingInterval",
    "WriterGroupId",
    "DataSetWriterId",
    "ConfigurationVersion",
    "State",
];

impl Psm {
    fn ensure_folder(&self) {
        let folder = folder_id();
        let _ = self.host.add_node(
            &folder,
            NodeClass::Object,
            &NodeId::NULL,
            &QualifiedName::new(0, "PublishSubscribe"),
        );
    }

    fn represent_object(&self, component: u32, name: &str, parent: &NodeId) {
        if !self.info_model {
            return;
        }
        self.ensure_folder();
        let node = NodeId::numeric(super::PUBSUB_NAMESPACE, component);
        let _ = self.host.add_node(
            &node,
            NodeClass::Object,
            parent,
            &QualifiedName::new(super::PUBSUB_NAMESPACE, name),
        );
    }

    fn represent_property(&self, component: u32, name: &str, value: Variant) {
        let node = property_id(component, name);
        let parent = NodeId::numeric(super::PUBSUB_NAMESPACE, component);
        let _ = self.host.add_node(
            &node,
            NodeClass::Variable,
            &parent,
            &QualifiedName::new(super::PUBSUB_NAMESPACE, name),
        );
        let _ = self.host.write(&node, AttributeId::Value, None, DataValue::from_variant(value));
    }

    /// Push the live state into the `State` property.
    pub(crate) fn info_model_sync_state(&self, node: &NodeId, state: PubSubState) {
        if !self.info_model {
            return;
        }
        if let Ok(id) = Self::component_id(node) {
            let _ = self.host.write(
                &property_id(id, "State"),
                AttributeId::Value,
                None,
                DataValue::from_variant(Variant::Int32(state.to_wire())),
            );
        }
    }

    pub(crate) fn represent_connection(&self, id: u32) {
        if !self.info_model {
            return;
        }
        let Some(c) = self.connections.get(&id) else { return };
        self.represent_object(id, &c.config.name, &folder_id());
        self.represent_property(id, "PublisherId", Variant::String(c.publisher_id.to_string()));
        self.represent_property(
            id,
            "TransportProfileUri",
            Variant::String(c.config.transport_profile_uri.clone()),
        );
        self.represent_property(id, "Address", Variant::String(c.config.address.url.clone()));
        self.represent_property(id, "State", Variant::Int32(c.head.state.to_wire()));
    }

    pub(crate) fn represent_writer_group(&self, id: u32) {
        if !self.info_model {
            return;
        }
        let Some(wg) = self.writer_groups.get(&id) else { return };
        let parent = NodeId::numeric(super::PUBSUB_NAMESPACE, wg.connection);
        self.represent_object(id, &wg.config.name, &parent);
        self.represent_property(
            id,
            "PublishingInterval",
            Variant::Double(wg.config.publishing_interval_ms),
        );
        self.represent_property(id, "WriterGroupId", Variant::UInt16(wg.config.writer_group_id));
        self.represent_property(id, "State", Variant::Int32(wg.head.state.to_wire()));
    }

    pub(crate) fn represent_dataset_writer(&self, id: u32) {
        if !self.info_model {
            return;
        }
        let Some(dsw) = self.dataset_writers.get(&id) else { return };
        let parent = NodeId::numeric(super::PUBSUB_NAMESPACE, dsw.writer_group);
        self.represent_object(id, &dsw.config.name, &parent);
        self.represent_property(
            id,
            "DataSetWriterId",
            Variant::UInt16(dsw.config.dataset_writer_id),
        );
        self.represent_property(id, "State", Variant::Int32(dsw.head.state.to_wire()));
    }

    pub(crate) fn represent_reader_group(&self, id: u32) {
        if !self.info_model {
            return;
        }
        let Some(rg) = self.reader_groups.get(&id) else { return };
        let parent = NodeId::numeric(super::PUBSUB_NAMESPACE, rg.connection);
        self.represent_object(id, &rg.config.name, &parent);
        self.represent_property(id, "State", Variant::Int32(rg.head.state.to_wire()));
    }

    pub(crate) fn represent_dataset_reader(&self, id: u32) {
        if !self.info_model {
            return;
        }
        let Some(dsr) = self.dataset_readers.get(&id) else { return };
        let parent = NodeId::numeric(super::PUBSUB_NAMESPACE, dsr.reader_group);
        self.represent_object(id, &dsr.config.name, &parent);
        self.represent_property(
            id,
            "DataSetWriterId",
            Variant::UInt16(dsr.config.dataset_writer_id),
        );
        self.represent_property(id, "State", Variant::Int32(dsr.head.state.to_wire()));
    }

    pub(crate) fn represent_published_dataset(&self, id: u32) {
        if !self.info_model {
            return;
        }
        let Some(pds) = self.published_datasets.get(&id) else { return };
        self.represent_object(id, &pds.config.name, &folder_id());
        self.represent_property(
            id,
            "ConfigurationVersion",
            Variant::UInt32(pds.metadata.configuration_version.major),
        );
    }

    /// Remove a component's object node and its property nodes.
    pub(crate) fn unrepresent(&self, node: &NodeId) {
        if !self.info_model {
            return;
        }
        if let Ok(id) = Self::component_id(node) {
            for name in PROPERTY_NAMES {
                let _ = self.host.delete_node(&property_id(id, name));
            }
        }
        let _ = self.host.delete_node(node);
    }
}

impl PubSubManager {
    /// Write a represented property. `PublishingInterval` writes re-register
    /// the publish timer of a running WriterGroup.
    pub fn write_info_model_property(&self, node: &NodeId, value: &Variant) -> crate::Result<()> {
        let component = {
            let psm = self.psm.lock();
            if !psm.info_model {
                return Err(StatusCode::BAD_NOT_SUPPORTED);
            }
            let Identifier::String(name) = &node.identifier else {
                return Err(StatusCode::BAD_NODE_ID_UNKNOWN);
            };
            let Some((component, property)) = name.split_once('.') else {
                return Err(StatusCode::BAD_NODE_ID_UNKNOWN);
            };
            if property != "PublishingInterval" {
                return Err(StatusCode::BAD_NOT_SUPPORTED);
            }
            component.parse::<u32>().map_err(|_| StatusCode::BAD_NODE_ID_UNKNOWN)?
        };

        let interval = match value {
            Variant::Double(v) => *v,
            Variant::Float(v) => f64::from(*v),
            _ => return Err(StatusCode::BAD_TYPE_MISMATCH),
        };
        let wg_node = NodeId::numeric(super::PUBSUB_NAMESPACE, component);
        self.set_writer_group_publishing_interval(&wg_node, interval)?;

        let psm = self.psm.lock();
        let _ = psm.host.write(
            node,
            AttributeId::Value,
            None,
            DataValue::from_variant(Variant::Double(interval)),
        );
        Ok(())
    }
}
