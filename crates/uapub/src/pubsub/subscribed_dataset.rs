// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SubscribedDataSet: receiver-side target mapping for one DataSetReader.

use super::dataset_reader::FieldTarget;
use super::{ComponentHead, ComponentKind, Psm, PubSubManager};
use crate::types::{NodeId, StatusCode};

/// Target-variable list or a mirror of the publisher's DataSet. Mirror is a
/// type marker only and cannot be connected.
#[derive(Debug, Clone)]
pub enum SubscribedDataSetKind {
    TargetVariables(Vec<FieldTarget>),
    Mirror,
}

impl Default for SubscribedDataSetKind {
    fn default() -> Self {
        SubscribedDataSetKind::TargetVariables(Vec::new())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscribedDataSetConfig {
    pub name: String,
    pub kind: SubscribedDataSetKind,
}

pub(crate) struct SubscribedDataSet {
    pub head: ComponentHead,
    pub config: SubscribedDataSetConfig,
    /// Back-pointer enforcing the single-reader claim.
    pub connected_reader: Option<u32>,
}

impl Psm {
    pub(crate) fn find_sds_by_name(&self, name: &str) -> Option<u32> {
        self.subscribed_datasets
            .iter()
            .find(|(_, sds)| sds.config.name == name)
            .map(|(id, _)| *id)
    }
}

impl PubSubManager {
    pub fn add_subscribed_dataset(&self, cfg: &SubscribedDataSetConfig) -> crate::Result<NodeId> {
        let mut psm = self.psm.lock();
        if cfg.name.is_empty() {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        if psm.find_sds_by_name(&cfg.name).is_some() {
            return Err(StatusCode::BAD_BROWSE_NAME_DUPLICATED);
        }
        let id = psm.generate_id();
        let head = ComponentHead::new(id, ComponentKind::SubscribedDataSet, &cfg.name);
        psm.check_lifecycle(&head.node_id, ComponentKind::SubscribedDataSet, false)?;
        let node_id = head.node_id.clone();
        log::info!("{} SubscribedDataSet created", head.log_id);
        psm.subscribed_datasets
            .insert(id, SubscribedDataSet { head, config: cfg.clone(), connected_reader: None });
        Ok(node_id)
    }

    pub fn remove_subscribed_dataset(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        let sds = psm.subscribed_datasets.get(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
        psm.check_lifecycle(node, ComponentKind::SubscribedDataSet, true)?;
        if let Some(reader) = sds.connected_reader {
            if let Some(dsr) = psm.dataset_readers.get_mut(&reader) {
                dsr.subscribed_dataset = None;
            }
        }
        let sds = psm.subscribed_datasets.remove(&id).expect("present");
        log::info!("{} SubscribedDataSet removed", sds.head.log_id);
        Ok(())
    }

    /// Connect a DataSetReader to a standalone SubscribedDataSet. Exactly
    /// one reader may claim a given SubscribedDataSet.
    pub fn connect_dataset_reader(
        &self,
        reader_node: &NodeId,
        sds_node: &NodeId,
    ) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let reader_id = Psm::component_id(reader_node)?;
        let sds_id = Psm::component_id(sds_node)?;
        if !psm.dataset_readers.contains_key(&reader_id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        {
            let sds = psm.subscribed_datasets.get(&sds_id).ok_or(StatusCode::BAD_NOT_FOUND)?;
            match sds.connected_reader {
                Some(existing) if existing != reader_id => {
                    return Err(StatusCode::BAD_CONFIGURATION_ERROR);
                }
                _ => {}
            }
            if matches!(sds.config.kind, SubscribedDataSetKind::Mirror) {
                return Err(StatusCode::BAD_NOT_IMPLEMENTED);
            }
        }

        let targets = match &psm.subscribed_datasets[&sds_id].config.kind {
            SubscribedDataSetKind::TargetVariables(tv) => tv.clone(),
            SubscribedDataSetKind::Mirror => unreachable!(),
        };
        let dsr = psm.dataset_readers.get_mut(&reader_id).expect("present");
        dsr.subscribed_dataset = Some(sds_id);
        dsr.config.target_variables = targets;
        psm.subscribed_datasets.get_mut(&sds_id).expect("present").connected_reader =
            Some(reader_id);
        Ok(())
    }

    #[must_use]
    pub fn subscribed_dataset_count(&self) -> usize {
        self.psm.lock().subscribed_datasets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventloop::DefaultEventLoop;
    use crate::host::MemoryAddressSpace;
    use std::sync::Arc;

    fn manager() -> PubSubManager {
        PubSubManager::builder()
            .event_loop(Arc::new(DefaultEventLoop::new()))
            .host(Arc::new(MemoryAddressSpace::new()))
            .build()
            .expect("build")
    }

    #[test]
    fn test_add_remove() {
        let m = manager();
        let cfg = SubscribedDataSetConfig { name: "s1".into(), ..Default::default() };
        let id = m.add_subscribed_dataset(&cfg).expect("add");
        assert_eq!(m.subscribed_dataset_count(), 1);
        assert_eq!(
            m.add_subscribed_dataset(&cfg),
            Err(StatusCode::BAD_BROWSE_NAME_DUPLICATED)
        );
        m.remove_subscribed_dataset(&id).expect("remove");
        assert_eq!(m.subscribed_dataset_count(), 0);
    }

    #[test]
    fn test_mirror_cannot_connect() {
        let m = manager();
        let sds = m
            .add_subscribed_dataset(&SubscribedDataSetConfig {
                name: "mirror".into(),
                kind: SubscribedDataSetKind::Mirror,
            })
            .expect("add");
        // no reader exists, reader lookup fails first
        assert!(m.connect_dataset_reader(&NodeId::numeric(1, 999), &sds).is_err());
    }
}
