// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DataSetReader: filter and sink for matching DataSetMessages.
//!
//! A Reader claims inbound traffic by its (PublisherId, WriterGroupId,
//! DataSetWriterId) triple and writes the decoded field values to the
//! target variables of its SubscribedDataSet through the host Write
//! service. A configurable receive timeout drives the Reader to Error when
//! the publisher goes quiet.

use super::{
    ComponentHead, ComponentKind, CustomStateMachine, Psm, PubSubManager, PubSubState,
};
use crate::eventloop::{TimerId, TimerPolicy};
use crate::host::AttributeId;
use crate::protocol::uadp::{DataSetMessage, DataSetPayload, NetworkMessage};
use crate::protocol::{uadp, DataSetMetaData, PublisherId};
use crate::types::{DataValue, Guid, NodeId, StatusCode};

/// Receiver-side mapping of one DataSet field to a target variable.
#[derive(Debug, Clone, Default)]
pub struct FieldTarget {
    pub dataset_field_id: Guid,
    pub receiver_index_range: String,
    pub target_node_id: NodeId,
    pub attribute_id: AttributeId,
}

#[derive(Clone)]
pub struct DataSetReaderConfig {
    pub name: String,
    /// Expected publisher identity (same variant and value required).
    pub publisher_id: PublisherId,
    pub writer_group_id: u16,
    pub dataset_writer_id: u16,
    pub dataset_metadata: DataSetMetaData,
    /// 0 disables the receive timeout.
    pub message_receive_timeout_ms: f64,
    pub target_variables: Vec<FieldTarget>,
    pub custom_state_machine: Option<CustomStateMachine>,
}

impl Default for DataSetReaderConfig {
    fn default() -> Self {
        DataSetReaderConfig {
            name: String::new(),
            publisher_id: PublisherId::default(),
            writer_group_id: 0,
            dataset_writer_id: 0,
            dataset_metadata: DataSetMetaData::default(),
            message_receive_timeout_ms: 0.0,
            target_variables: Vec::new(),
            custom_state_machine: None,
        }
    }
}

pub(crate) struct DataSetReader {
    pub head: ComponentHead,
    pub config: DataSetReaderConfig,
    pub reader_group: u32,
    /// Single-shot receive-timeout timer (0 = not scheduled).
    pub timeout_timer: TimerId,
    /// Standalone SubscribedDataSet this reader claimed, if any.
    pub subscribed_dataset: Option<u32>,
}

impl Psm {
    /// Identity triple match: PublisherId (same variant and value),
    /// WriterGroupId, and membership in the payload writer-id list. Header
    /// fields absent from the wire do not filter.
    pub(crate) fn dataset_reader_check_identifier(
        &self,
        dsr: &DataSetReader,
        nm: &NetworkMessage,
    ) -> bool {
        if nm.publisher_id_enabled {
            match &nm.publisher_id {
                Some(pid) if pid.matches(&dsr.config.publisher_id) => {}
                _ => {
                    log::debug!(
                        "{} PublisherId does not match: expected {}, received {}",
                        dsr.head.log_id,
                        dsr.config.publisher_id,
                        nm.publisher_id.as_ref().map_or("-".to_string(), |p| p.to_string())
                    );
                    return false;
                }
            }
        }

        if nm.group_header_enabled && nm.group_header.writer_group_id_enabled {
            if dsr.config.writer_group_id != nm.group_header.writer_group_id {
                log::debug!(
                    "{} WriterGroupId does not match: expected {}, received {}",
                    dsr.head.log_id,
                    dsr.config.writer_group_id,
                    nm.group_header.writer_group_id
                );
                return false;
            }
        }

        if nm.payload_header_enabled {
            if !nm.dataset_writer_ids.contains(&dsr.config.dataset_writer_id) {
                log::debug!(
                    "{} DataSetWriterIds in the payload do not match",
                    dsr.head.log_id
                );
                return false;
            }
        }

        true
    }

    /// DataSetReader state machine: the reader follows its ReaderGroup.
    /// `reason` is reported through the state-change hook (timeouts, decode
    /// failures).
    pub(crate) fn dataset_reader_set_state(
        &mut self,
        id: u32,
        target: PubSubState,
        mut reason: StatusCode,
    ) {
        let Some(dsr) = self.dataset_readers.get(&id) else { return };
        let node = dsr.head.node_id.clone();
        let old = dsr.head.state;
        let custom = dsr.config.custom_state_machine.clone();
        let rg_state = self.reader_groups.get(&dsr.reader_group).map(|rg| rg.head.state);

        let new = if let Some(csm) = custom {
            let (new_state, status) = csm(&node, old, target);
            reason = status;
            new_state
        } else {
            match target {
                PubSubState::Disabled | PubSubState::Error => target,
                PubSubState::Paused | PubSubState::PreOperational | PubSubState::Operational => {
                    match rg_state {
                        Some(PubSubState::Operational) | Some(PubSubState::PreOperational) => {
                            rg_state.expect("checked")
                        }
                        _ => PubSubState::Paused,
                    }
                }
            }
        };

        // The timeout timer runs while the reader expects messages.
        let expects_messages =
            matches!(new, PubSubState::Operational | PubSubState::PreOperational);
        let timer = {
            let dsr = self.dataset_readers.get_mut(&id).expect("present");
            dsr.head.state = new;
            if !expects_messages && dsr.timeout_timer != 0 {
                let t = dsr.timeout_timer;
                dsr.timeout_timer = 0;
                Some(t)
            } else {
                None
            }
        };
        if let Some(t) = timer {
            self.event_loop.remove_timer(t);
        }
        if expects_messages {
            // A quiet channel must still trip the timeout.
            self.dataset_reader_arm_timeout(id);
        }

        if new != old {
            let log_id = self.dataset_readers[&id].head.log_id.clone();
            self.notify_state_change(&log_id, &node, old, new, reason);
        }
    }

    /// Receive-timeout expiry.
    fn dataset_reader_handle_timeout(&mut self, id: u32) {
        let Some(dsr) = self.dataset_readers.get(&id) else { return };
        // No error if we do not expect messages to arrive.
        if !matches!(dsr.head.state, PubSubState::Operational | PubSubState::PreOperational) {
            return;
        }
        log::debug!("{} message receive timeout occurred", dsr.head.log_id);
        self.dataset_reader_set_state(id, PubSubState::Error, StatusCode::BAD_TIMEOUT);
    }

    /// (Re)arm the timeout on a processed message. Expiry is measured from
    /// now, not from the previous schedule, to avoid catch-up after gaps.
    fn dataset_reader_arm_timeout(&mut self, id: u32) {
        let (timer, timeout) = {
            let Some(dsr) = self.dataset_readers.get(&id) else { return };
            (dsr.timeout_timer, dsr.config.message_receive_timeout_ms)
        };
        if timeout <= 0.0 {
            return;
        }
        if timer == 0 {
            let weak = self.self_ref.clone();
            if let Ok(new_timer) = self.event_loop.add_timer(
                timeout,
                Box::new(move || {
                    let Some(psm) = weak.upgrade() else { return };
                    let mut psm = psm.lock();
                    psm.dataset_reader_handle_timeout(id);
                }),
            ) {
                self.dataset_readers.get_mut(&id).expect("present").timeout_timer = new_timer;
            }
        } else {
            let _ = self.event_loop.modify_timer(timer, timeout, TimerPolicy::CurrentTime);
        }
    }

    /// Process one matching DataSetMessage.
    pub(crate) fn dataset_reader_process(&mut self, id: u32, dsm: &DataSetMessage) {
        let state = {
            let Some(dsr) = self.dataset_readers.get(&id) else { return };
            log::debug!("{} received a DataSetMessage", dsr.head.log_id);
            dsr.head.state
        };

        // First matching message: PreOperational -> Operational.
        if state == PubSubState::PreOperational {
            self.dataset_reader_set_state(id, state, StatusCode::GOOD);
        }
        let state = self.dataset_readers.get(&id).map(|d| d.head.state);
        if !matches!(
            state,
            Some(PubSubState::Operational) | Some(PubSubState::PreOperational)
        ) {
            return;
        }

        if !dsm.header.valid {
            let log_id = self.dataset_readers[&id].head.log_id.clone();
            log::info!("{} DataSetMessage discarded: message is not valid", log_id);
            return;
        }

        self.dataset_reader_arm_timeout(id);

        match &dsm.payload {
            // Heartbeat: nothing beyond the timeout update.
            DataSetPayload::KeepAlive => {}
            DataSetPayload::RawKeyFrame(blob) => self.dataset_reader_process_raw(id, blob),
            DataSetPayload::KeyFrame(fields) => {
                if fields.is_empty() {
                    return; // zero-field key frame counts as a heartbeat
                }
                let (meta_count, tv_count) = {
                    let dsr = &self.dataset_readers[&id];
                    (
                        dsr.config.dataset_metadata.fields.len(),
                        dsr.config.target_variables.len(),
                    )
                };
                if meta_count != fields.len() {
                    let log_id = self.dataset_readers[&id].head.log_id.clone();
                    log::warn!(
                        "{} field count does not match the DataSetMetaData configuration",
                        log_id
                    );
                    return;
                }
                if tv_count != fields.len() {
                    let log_id = self.dataset_readers[&id].head.log_id.clone();
                    log::warn!(
                        "{} field count does not match the TargetVariables configuration",
                        log_id
                    );
                    return;
                }
                for (i, field) in fields.iter().enumerate() {
                    self.dataset_reader_write_field(id, i, field);
                }
            }
            DataSetPayload::DeltaFrame(fields) => {
                for (index, field) in fields {
                    self.dataset_reader_write_field(id, *index as usize, field);
                }
            }
        }
    }

    /// Raw key frame: split against the configured metadata, then write.
    fn dataset_reader_process_raw(&mut self, id: u32, blob: &[u8]) {
        let (fields_meta, tv_count, log_id) = {
            let dsr = &self.dataset_readers[&id];
            (
                dsr.config.dataset_metadata.fields.clone(),
                dsr.config.target_variables.len(),
                dsr.head.log_id.clone(),
            )
        };
        log::trace!("{} received a RAW frame", log_id);
        if fields_meta.len() != tv_count {
            log::error!("{} inconsistent number of fields configured", log_id);
            return;
        }
        let values = match uadp::decode::decode_raw_fields(blob, &fields_meta) {
            Ok(values) => values,
            Err(e) => {
                log::info!("{} raw decode failed with {}", log_id, e);
                return;
            }
        };
        for (i, dv) in values.iter().enumerate() {
            self.dataset_reader_write_field(id, i, dv);
        }
    }

    /// Write one field to its target variable through the host Write
    /// service.
    fn dataset_reader_write_field(&mut self, id: u32, index: usize, field: &DataValue) {
        if !field.has_value() {
            return;
        }
        let (target, log_id) = {
            let Some(dsr) = self.dataset_readers.get(&id) else { return };
            let Some(tv) = dsr.config.target_variables.get(index) else {
                log::warn!(
                    "{} no target variable for field index {}",
                    dsr.head.log_id,
                    index
                );
                return;
            };
            (tv.clone(), dsr.head.log_id.clone())
        };
        let range = if target.receiver_index_range.is_empty() {
            None
        } else {
            Some(target.receiver_index_range.as_str())
        };
        let status =
            self.host.write(&target.target_node_id, target.attribute_id, range, field.clone());
        if status.is_bad() {
            log::info!("{} error writing field {}: {}", log_id, index, status);
        }
    }

    pub(crate) fn dataset_reader_remove(&mut self, id: u32) {
        let Some(dsr) = self.dataset_readers.remove(&id) else { return };
        if dsr.timeout_timer != 0 {
            self.event_loop.remove_timer(dsr.timeout_timer);
        }
        if let Some(sds) = dsr.subscribed_dataset {
            if let Some(sds) = self.subscribed_datasets.get_mut(&sds) {
                sds.connected_reader = None;
            }
        }
        if let Some(rg) = self.reader_groups.get_mut(&dsr.reader_group) {
            rg.readers.retain(|r| *r != id);
        }
        log::info!("{} DataSetReader removed", dsr.head.log_id);

        #[cfg(feature = "information-model")]
        self.unrepresent(&dsr.head.node_id);
    }
}

impl PubSubManager {
    /// Add a DataSetReader into a ReaderGroup. The reader starts Disabled.
    pub fn add_dataset_reader(
        &self,
        reader_group: &NodeId,
        cfg: &DataSetReaderConfig,
    ) -> crate::Result<NodeId> {
        let mut psm = self.psm.lock();
        let rg_id = Psm::component_id(reader_group)?;
        if !psm.reader_groups.contains_key(&rg_id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        if cfg.message_receive_timeout_ms < 0.0 || !cfg.message_receive_timeout_ms.is_finite() {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }

        let id = psm.generate_id();
        let head = ComponentHead::new(id, ComponentKind::DataSetReader, &cfg.name);
        psm.check_lifecycle(&head.node_id, ComponentKind::DataSetReader, false)?;
        let node_id = head.node_id.clone();
        log::info!("{} DataSetReader created", head.log_id);

        psm.dataset_readers.insert(
            id,
            DataSetReader {
                head,
                config: cfg.clone(),
                reader_group: rg_id,
                timeout_timer: 0,
                subscribed_dataset: None,
            },
        );
        psm.reader_groups.get_mut(&rg_id).expect("present").readers.push(id);

        psm.dataset_reader_set_state(id, PubSubState::Disabled, StatusCode::GOOD);

        #[cfg(feature = "information-model")]
        psm.represent_dataset_reader(id);

        Ok(node_id)
    }

    pub fn remove_dataset_reader(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        if !psm.dataset_readers.contains_key(&id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        psm.check_lifecycle(node, ComponentKind::DataSetReader, true)?;
        psm.dataset_reader_remove(id);
        Ok(())
    }

    pub fn enable_dataset_reader(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        if !psm.dataset_readers.contains_key(&id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        psm.dataset_reader_set_state(id, PubSubState::Operational, StatusCode::GOOD);
        Ok(())
    }

    pub fn disable_dataset_reader(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        if !psm.dataset_readers.contains_key(&id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        psm.dataset_reader_set_state(id, PubSubState::Disabled, StatusCode::GOOD);
        Ok(())
    }

    pub fn get_dataset_reader_config(&self, node: &NodeId) -> crate::Result<DataSetReaderConfig> {
        let psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.dataset_readers.get(&id).map(|r| r.config.clone()).ok_or(StatusCode::BAD_NOT_FOUND)
    }

    pub fn get_dataset_reader_state(&self, node: &NodeId) -> crate::Result<PubSubState> {
        let psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.dataset_readers.get(&id).map(|r| r.head.state).ok_or(StatusCode::BAD_NOT_FOUND)
    }

    /// Replace the target-variable list. Only allowed while the reader is
    /// not enabled.
    pub fn set_dataset_reader_target_variables(
        &self,
        node: &NodeId,
        targets: &[FieldTarget],
    ) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        let dsr = psm.dataset_readers.get_mut(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
        if dsr.head.state.is_enabled() {
            log::warn!(
                "{} cannot set target variables while the DataSetReader is enabled",
                dsr.head.log_id
            );
            return Err(StatusCode::BAD_CONFIGURATION_ERROR);
        }
        dsr.config.target_variables = targets.to_vec();
        Ok(())
    }

    #[must_use]
    pub fn dataset_reader_count(&self) -> usize {
        self.psm.lock().dataset_readers.len()
    }
}
