// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PublishedDataSet and DataSetField.
//!
//! A PublishedDataSet is a named, ordered list of fields sampled from the
//! host address space. Field metadata is derived when the field is added and
//! cached; the configuration version is stamped on every mutation. The
//! freeze counter blocks destructive edits while an encoder is validating
//! the layout mid-batch.

use super::{ComponentHead, ComponentKind, Psm, PubSubManager};
use crate::host::AttributeId;
use crate::protocol::{ConfigurationVersion, DataSetMetaData, FieldMetaData, FIELD_FLAG_PROMOTED};
use crate::types::{DataValue, LocalizedText, NodeId, StatusCode};

/// Seconds between 1601-01-01 (OPC UA epoch) and 2000-01-01 (version epoch).
const VERSION_EPOCH_UNIX: i64 = 946_684_800;

/// Configuration-version stamp: seconds since 2000-01-01.
pub(crate) fn config_version_now() -> u32 {
    let unix = crate::types::DateTime::now().as_unix_seconds();
    (unix - VERSION_EPOCH_UNIX).max(0) as u32
}

/// Source reference of a published field.
#[derive(Debug, Clone)]
pub struct PublishedVariable {
    pub published_variable: NodeId,
    pub attribute_id: AttributeId,
    pub index_range: String,
    pub sampling_interval_hint_ms: f64,
}

impl Default for PublishedVariable {
    fn default() -> Self {
        PublishedVariable {
            published_variable: NodeId::NULL,
            attribute_id: AttributeId::Value,
            index_range: String::new(),
            sampling_interval_hint_ms: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DataSetFieldConfig {
    pub field_name_alias: String,
    pub promoted_field: bool,
    pub publish_parameters: PublishedVariable,
    /// Fixed raw-framing budget for String/ByteString fields (0 = none).
    pub max_string_length: u32,
}

/// Variable-based vs event-based DataSets. Only Variable is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishedDataSetType {
    #[default]
    Items,
    Events,
}

#[derive(Debug, Clone, Default)]
pub struct PublishedDataSetConfig {
    pub name: String,
    pub dataset_type: PublishedDataSetType,
}

pub(crate) struct DataSetField {
    pub node_id: NodeId,
    pub config: DataSetFieldConfig,
}

pub(crate) struct PublishedDataSet {
    pub head: ComponentHead,
    pub config: PublishedDataSetConfig,
    pub fields: Vec<DataSetField>,
    pub metadata: DataSetMetaData,
    pub promoted_count: u16,
    /// Nonzero while a consumer validates the layout; blocks mutation.
    pub freeze_count: u16,
}

impl PublishedDataSet {
    /// Sample one field through the host Read service.
    pub(crate) fn sample_field(
        host: &dyn crate::host::HostServices,
        field: &DataSetField,
    ) -> DataValue {
        let pp = &field.config.publish_parameters;
        let range =
            if pp.index_range.is_empty() { None } else { Some(pp.index_range.as_str()) };
        host.read(&pp.published_variable, pp.attribute_id, range)
    }
}

impl Psm {
    pub(crate) fn find_pds_by_name(&self, name: &str) -> Option<u32> {
        self.published_datasets
            .iter()
            .find(|(_, pds)| pds.config.name == name)
            .map(|(id, _)| *id)
    }

    /// Derive field metadata by inspecting the current source value.
    fn generate_field_metadata(&mut self, cfg: &DataSetFieldConfig) -> FieldMetaData {
        let sampled = {
            let pp = &cfg.publish_parameters;
            let range =
                if pp.index_range.is_empty() { None } else { Some(pp.index_range.as_str()) };
            self.host.read(&pp.published_variable, pp.attribute_id, range)
        };

        let mut fm = FieldMetaData {
            name: cfg.field_name_alias.clone(),
            description: LocalizedText::english(&cfg.field_name_alias),
            max_string_length: cfg.max_string_length,
            value_rank: -1,
            dataset_field_id: self.generate_guid(),
            ..Default::default()
        };
        if cfg.promoted_field {
            fm.field_flags |= FIELD_FLAG_PROMOTED;
        }
        if let Some(value) = sampled.value {
            if let Some(ty) = value.built_in_type() {
                fm.built_in_type = ty as u8;
                fm.data_type = ty.data_type_id();
            }
            fm.value_rank = value.value_rank();
            if let crate::types::Variant::Array { values, dimensions, .. } = &value {
                fm.array_dimensions =
                    dimensions.clone().unwrap_or_else(|| vec![values.len() as u32]);
            }
        }
        fm
    }

    fn bump_config_version(&mut self, pds_id: u32, major: bool) {
        let stamp = config_version_now();
        if let Some(pds) = self.published_datasets.get_mut(&pds_id) {
            if major {
                pds.metadata.configuration_version.major = stamp;
            }
            pds.metadata.configuration_version.minor = stamp;
        }
    }
}

impl PubSubManager {
    /// Add a PublishedDataSet. The name must be non-empty and unique.
    pub fn add_published_dataset(&self, cfg: &PublishedDataSetConfig) -> crate::Result<NodeId> {
        let mut psm = self.psm.lock();
        if cfg.name.is_empty() {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        if cfg.dataset_type == PublishedDataSetType::Events {
            return Err(StatusCode::BAD_NOT_IMPLEMENTED);
        }
        if psm.find_pds_by_name(&cfg.name).is_some() {
            return Err(StatusCode::BAD_BROWSE_NAME_DUPLICATED);
        }

        let id = psm.generate_id();
        let head = ComponentHead::new(id, ComponentKind::PublishedDataSet, &cfg.name);
        psm.check_lifecycle(&head.node_id, ComponentKind::PublishedDataSet, false)?;

        let stamp = config_version_now();
        let node_id = head.node_id.clone();
        log::info!("{} PublishedDataSet created", head.log_id);
        let pds = PublishedDataSet {
            head,
            config: cfg.clone(),
            fields: Vec::new(),
            metadata: DataSetMetaData {
                name: cfg.name.clone(),
                configuration_version: ConfigurationVersion { major: stamp, minor: stamp },
                ..Default::default()
            },
            promoted_count: 0,
            freeze_count: 0,
        };
        psm.published_datasets.insert(id, pds);

        #[cfg(feature = "information-model")]
        psm.represent_published_dataset(id);

        Ok(node_id)
    }

    /// Remove a PublishedDataSet. Fails while the layout is frozen or while
    /// DataSetWriters still reference it.
    pub fn remove_published_dataset(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        let pds = psm.published_datasets.get(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
        if pds.freeze_count > 0 {
            return Err(StatusCode::BAD_CONFIGURATION_ERROR);
        }
        psm.check_lifecycle(node, ComponentKind::PublishedDataSet, true)?;

        // Detach writers that reference this PDS.
        for dsw in psm.dataset_writers.values_mut() {
            if dsw.published_dataset == Some(id) {
                dsw.published_dataset = None;
            }
        }
        let pds = psm.published_datasets.remove(&id).expect("present");
        log::info!("{} PublishedDataSet removed", pds.head.log_id);

        #[cfg(feature = "information-model")]
        psm.unrepresent(&pds.head.node_id);

        Ok(())
    }

    /// Add a field to a PublishedDataSet. Blocked while frozen.
    pub fn add_dataset_field(
        &self,
        pds_node: &NodeId,
        cfg: &DataSetFieldConfig,
    ) -> crate::Result<NodeId> {
        let mut psm = self.psm.lock();
        let pds_id = Psm::component_id(pds_node)?;
        {
            let pds = psm.published_datasets.get(&pds_id).ok_or(StatusCode::BAD_NOT_FOUND)?;
            if pds.freeze_count > 0 {
                return Err(StatusCode::BAD_CONFIGURATION_ERROR);
            }
            if pds.config.dataset_type != PublishedDataSetType::Items {
                return Err(StatusCode::BAD_NOT_IMPLEMENTED);
            }
        }
        if cfg.field_name_alias.is_empty() {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }

        let fm = psm.generate_field_metadata(cfg);
        let field_id = psm.generate_id();
        let node_id = NodeId::numeric(super::PUBSUB_NAMESPACE, field_id);

        let pds = psm.published_datasets.get_mut(&pds_id).expect("present");
        if cfg.promoted_field {
            pds.promoted_count += 1;
        }
        pds.metadata.fields.push(fm);
        pds.fields.push(DataSetField { node_id: node_id.clone(), config: cfg.clone() });
        log::debug!("{} field '{}' added", pds.head.log_id, cfg.field_name_alias);

        psm.bump_config_version(pds_id, true);
        Ok(node_id)
    }

    /// Remove a field by its node id.
    pub fn remove_dataset_field(&self, field_node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let mut owner = None;
        for (pds_id, pds) in &psm.published_datasets {
            if let Some(pos) = pds.fields.iter().position(|f| &f.node_id == field_node) {
                owner = Some((*pds_id, pos));
                break;
            }
        }
        let (pds_id, pos) = owner.ok_or(StatusCode::BAD_NOT_FOUND)?;
        {
            let pds = psm.published_datasets.get_mut(&pds_id).expect("present");
            if pds.freeze_count > 0 {
                return Err(StatusCode::BAD_CONFIGURATION_ERROR);
            }
            let field = pds.fields.remove(pos);
            pds.metadata.fields.remove(pos);
            if field.config.promoted_field {
                pds.promoted_count -= 1;
            }
        }
        psm.bump_config_version(pds_id, true);
        Ok(())
    }

    pub fn get_published_dataset_config(
        &self,
        node: &NodeId,
    ) -> crate::Result<PublishedDataSetConfig> {
        let psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.published_datasets
            .get(&id)
            .map(|pds| pds.config.clone())
            .ok_or(StatusCode::BAD_NOT_FOUND)
    }

    pub fn get_published_dataset_metadata(&self, node: &NodeId) -> crate::Result<DataSetMetaData> {
        let psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.published_datasets
            .get(&id)
            .map(|pds| pds.metadata.clone())
            .ok_or(StatusCode::BAD_NOT_FOUND)
    }

    /// Find a PublishedDataSet by name.
    pub fn find_published_dataset(&self, name: &str) -> Option<NodeId> {
        let psm = self.psm.lock();
        psm.find_pds_by_name(name)
            .map(|id| NodeId::numeric(super::PUBSUB_NAMESPACE, id))
    }

    #[must_use]
    pub fn published_dataset_count(&self) -> usize {
        self.psm.lock().published_datasets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventloop::DefaultEventLoop;
    use crate::host::{MemoryAddressSpace, AttributeId};
    use crate::types::Variant;
    use std::sync::Arc;

    fn manager_with_node() -> (PubSubManager, Arc<MemoryAddressSpace>, NodeId) {
        let space = Arc::new(MemoryAddressSpace::new());
        let source = NodeId::numeric(2, 1000);
        space.put_variable(source.clone(), Variant::Double(21.5));
        let m = PubSubManager::builder()
            .event_loop(Arc::new(DefaultEventLoop::new()))
            .host(space.clone())
            .build()
            .expect("build");
        (m, space, source)
    }

    fn field_cfg(source: &NodeId, alias: &str) -> DataSetFieldConfig {
        DataSetFieldConfig {
            field_name_alias: alias.into(),
            publish_parameters: PublishedVariable {
                published_variable: source.clone(),
                attribute_id: AttributeId::Value,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_add_remove_pds() {
        let (m, _space, _source) = manager_with_node();
        let pds = m
            .add_published_dataset(&PublishedDataSetConfig { name: "p1".into(), ..Default::default() })
            .expect("add pds");
        assert_eq!(m.published_dataset_count(), 1);
        assert_eq!(m.find_published_dataset("p1"), Some(pds.clone()));
        m.remove_published_dataset(&pds).expect("remove");
        assert_eq!(m.published_dataset_count(), 0);
    }

    #[test]
    fn test_empty_name_rejected() {
        let (m, _, _) = manager_with_node();
        assert_eq!(
            m.add_published_dataset(&PublishedDataSetConfig::default()),
            Err(StatusCode::BAD_INVALID_ARGUMENT)
        );
        assert_eq!(m.published_dataset_count(), 0);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (m, _, _) = manager_with_node();
        let cfg = PublishedDataSetConfig { name: "dup".into(), ..Default::default() };
        m.add_published_dataset(&cfg).expect("first");
        assert_eq!(
            m.add_published_dataset(&cfg),
            Err(StatusCode::BAD_BROWSE_NAME_DUPLICATED)
        );
        assert_eq!(m.published_dataset_count(), 1);
    }

    #[test]
    fn test_event_datasets_unimplemented() {
        let (m, _, _) = manager_with_node();
        let cfg = PublishedDataSetConfig {
            name: "ev".into(),
            dataset_type: PublishedDataSetType::Events,
        };
        assert_eq!(m.add_published_dataset(&cfg), Err(StatusCode::BAD_NOT_IMPLEMENTED));
    }

    #[test]
    fn test_field_metadata_derived_from_source() {
        let (m, _space, source) = manager_with_node();
        let pds = m
            .add_published_dataset(&PublishedDataSetConfig { name: "p".into(), ..Default::default() })
            .expect("pds");
        m.add_dataset_field(&pds, &field_cfg(&source, "temperature")).expect("field");

        let md = m.get_published_dataset_metadata(&pds).expect("metadata");
        assert_eq!(md.fields.len(), 1);
        assert_eq!(md.fields[0].name, "temperature");
        assert_eq!(md.fields[0].built_in_type, crate::types::BuiltInType::Double as u8);
        assert_eq!(md.fields[0].value_rank, -1);
        assert!(!md.fields[0].dataset_field_id.is_null());
        assert!(md.configuration_version.major > 0);
    }

    #[test]
    fn test_remove_field_updates_version() {
        let (m, _space, source) = manager_with_node();
        let pds = m
            .add_published_dataset(&PublishedDataSetConfig { name: "p".into(), ..Default::default() })
            .expect("pds");
        let f1 = m.add_dataset_field(&pds, &field_cfg(&source, "a")).expect("field a");
        m.add_dataset_field(&pds, &field_cfg(&source, "b")).expect("field b");

        m.remove_dataset_field(&f1).expect("remove field");
        let md = m.get_published_dataset_metadata(&pds).expect("metadata");
        assert_eq!(md.fields.len(), 1);
        assert_eq!(md.fields[0].name, "b");

        assert_eq!(
            m.remove_dataset_field(&f1),
            Err(StatusCode::BAD_NOT_FOUND)
        );
    }
}
