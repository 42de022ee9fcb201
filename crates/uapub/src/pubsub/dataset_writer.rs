// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DataSetWriter: binds a PublishedDataSet to a WriterGroup and turns
//! sampled values into DataSetMessages.
//!
//! Key frames carry every field; in between, delta frames carry only the
//! fields whose sampled value differs from the per-writer sample cache. A
//! writer without a connected PublishedDataSet publishes keep-alive frames
//! (heartbeat).

use super::{
    ComponentHead, ComponentKind, CustomStateMachine, Psm, PubSubManager, PubSubState,
};
use crate::protocol::uadp::{
    DataSetMessage, DataSetMessageHeader, DataSetMessageType, DataSetPayload, FieldEncoding,
};
use crate::protocol::ConfigurationVersion;
use crate::types::{DataValue, DateTime, NodeId, StatusCode};

// DataSetFieldContentMask bits (Part 14 Section 6.2.4).
pub const FIELD_CONTENT_MASK_STATUS_CODE: u32 = 0x01;
pub const FIELD_CONTENT_MASK_SOURCE_TIMESTAMP: u32 = 0x02;
pub const FIELD_CONTENT_MASK_SERVER_TIMESTAMP: u32 = 0x04;
pub const FIELD_CONTENT_MASK_SOURCE_PICOSECONDS: u32 = 0x08;
pub const FIELD_CONTENT_MASK_SERVER_PICOSECONDS: u32 = 0x10;
pub const FIELD_CONTENT_MASK_RAW_DATA: u32 = 0x20;

// UadpDataSetMessageContentMask bits (Part 14 Section 6.3.1).
pub const DSM_CONTENT_MASK_TIMESTAMP: u32 = 0x01;
pub const DSM_CONTENT_MASK_PICOSECONDS: u32 = 0x02;
pub const DSM_CONTENT_MASK_STATUS: u32 = 0x04;
pub const DSM_CONTENT_MASK_MAJOR_VERSION: u32 = 0x08;
pub const DSM_CONTENT_MASK_MINOR_VERSION: u32 = 0x10;
pub const DSM_CONTENT_MASK_SEQUENCE_NUMBER: u32 = 0x20;

/// UADP per-writer message settings.
#[derive(Debug, Clone)]
pub struct UadpDataSetWriterMessageSettings {
    pub dataset_message_content_mask: u32,
    pub configured_size: u16,
    pub network_message_number: u16,
    pub dataset_offset: u16,
}

impl Default for UadpDataSetWriterMessageSettings {
    fn default() -> Self {
        UadpDataSetWriterMessageSettings {
            dataset_message_content_mask: DSM_CONTENT_MASK_SEQUENCE_NUMBER,
            configured_size: 0,
            network_message_number: 0,
            dataset_offset: 0,
        }
    }
}

#[derive(Clone)]
pub struct DataSetWriterConfig {
    pub name: String,
    /// Unique within the containing WriterGroup.
    pub dataset_writer_id: u16,
    pub field_content_mask: u32,
    /// Emit a key frame every n messages (<= 1: every message is a key
    /// frame).
    pub key_frame_count: u32,
    pub dataset_name: String,
    pub message_settings: UadpDataSetWriterMessageSettings,
    pub custom_state_machine: Option<CustomStateMachine>,
}

impl Default for DataSetWriterConfig {
    fn default() -> Self {
        DataSetWriterConfig {
            name: String::new(),
            dataset_writer_id: 0,
            field_content_mask: 0,
            key_frame_count: 1,
            dataset_name: String::new(),
            message_settings: UadpDataSetWriterMessageSettings::default(),
            custom_state_machine: None,
        }
    }
}

pub(crate) struct DataSetWriter {
    pub head: ComponentHead,
    pub config: DataSetWriterConfig,
    pub writer_group: u32,
    /// None for heartbeat-only writers.
    pub published_dataset: Option<u32>,
    /// PDS configuration version observed when the writer was connected.
    pub connected_version: ConfigurationVersion,

    /// Messages since the last key frame.
    pub delta_frame_counter: u32,
    /// Last sent value per field, for delta computation.
    pub last_samples: Vec<DataValue>,
    pub sequence_number: u16,
}

impl Psm {
    /// DataSetWriter state machine: the writer follows its WriterGroup.
    pub(crate) fn dataset_writer_set_state(
        &mut self,
        id: u32,
        target: PubSubState,
        mut reason: StatusCode,
    ) {
        let Some(dsw) = self.dataset_writers.get(&id) else { return };
        let node = dsw.head.node_id.clone();
        let old = dsw.head.state;
        let custom = dsw.config.custom_state_machine.clone();
        let wg_state = self.writer_groups.get(&dsw.writer_group).map(|wg| wg.head.state);

        let new = if let Some(csm) = custom {
            let (new_state, status) = csm(&node, old, target);
            reason = status;
            new_state
        } else {
            match target {
                PubSubState::Disabled | PubSubState::Error => target,
                PubSubState::Paused | PubSubState::PreOperational | PubSubState::Operational => {
                    match wg_state {
                        Some(PubSubState::Operational) => PubSubState::Operational,
                        Some(PubSubState::PreOperational) => PubSubState::PreOperational,
                        // Group disabled or paused: the writer pauses.
                        _ => PubSubState::Paused,
                    }
                }
            }
        };

        let dsw = self.dataset_writers.get_mut(&id).expect("present");
        dsw.head.state = new;
        if new != old {
            let log_id = dsw.head.log_id.clone();
            self.notify_state_change(&log_id, &node, old, new, reason);
        }
    }

    /// Build the next DataSetMessage for a writer (sampling, key/delta
    /// cadence, content masks).
    pub(crate) fn dataset_writer_generate_dsm(&mut self, id: u32) -> crate::Result<DataSetMessage> {
        let (pds_id, field_mask, dsm_mask, key_frame_count) = {
            let dsw = self.dataset_writers.get(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
            (
                dsw.published_dataset,
                dsw.config.field_content_mask,
                dsw.config.message_settings.dataset_message_content_mask,
                dsw.config.key_frame_count,
            )
        };

        // Heartbeat writer: no connected DataSet.
        let Some(pds_id) = pds_id else {
            let dsw = self.dataset_writers.get_mut(&id).expect("present");
            dsw.sequence_number = dsw.sequence_number.wrapping_add(1);
            return Ok(DataSetMessage::keep_alive(dsw.sequence_number));
        };

        // Sample all fields through the host Read service.
        let (samples, version) = {
            let host = &self.host;
            let pds = self.published_datasets.get(&pds_id).ok_or(StatusCode::BAD_NOT_FOUND)?;
            let samples: Vec<DataValue> = pds
                .fields
                .iter()
                .map(|f| super::PublishedDataSet::sample_field(host.as_ref(), f))
                .collect();
            (samples, pds.metadata.configuration_version)
        };

        let field_encoding = if field_mask & FIELD_CONTENT_MASK_RAW_DATA != 0 {
            FieldEncoding::RawData
        } else if field_mask
            & (FIELD_CONTENT_MASK_STATUS_CODE
                | FIELD_CONTENT_MASK_SOURCE_TIMESTAMP
                | FIELD_CONTENT_MASK_SERVER_TIMESTAMP
                | FIELD_CONTENT_MASK_SOURCE_PICOSECONDS
                | FIELD_CONTENT_MASK_SERVER_PICOSECONDS)
            != 0
        {
            FieldEncoding::DataValue
        } else {
            FieldEncoding::Variant
        };

        let shaped: Vec<DataValue> =
            samples.iter().map(|dv| shape_field(dv, field_mask)).collect();

        let dsw = self.dataset_writers.get_mut(&id).expect("present");

        // Key/delta cadence: a delta is only possible with a filled cache
        // and a stable field count. Raw encoding has no delta framing.
        let key_frame = key_frame_count <= 1
            || field_encoding == FieldEncoding::RawData
            || dsw.last_samples.len() != samples.len()
            || dsw.delta_frame_counter >= key_frame_count;

        let payload = if key_frame {
            dsw.delta_frame_counter = 1;
            DataSetPayload::KeyFrame(shaped)
        } else {
            dsw.delta_frame_counter += 1;
            let changed: Vec<(u16, DataValue)> = shaped
                .iter()
                .enumerate()
                .filter(|(i, _)| {
                    dsw.last_samples.get(*i).map(|prev| prev.value != samples[*i].value)
                        != Some(false)
                })
                .map(|(i, dv)| (i as u16, dv.clone()))
                .collect();
            DataSetPayload::DeltaFrame(changed)
        };
        dsw.last_samples = samples;
        dsw.sequence_number = dsw.sequence_number.wrapping_add(1);

        let header = DataSetMessageHeader {
            valid: true,
            field_encoding,
            message_type: if key_frame {
                DataSetMessageType::KeyFrame
            } else {
                DataSetMessageType::DeltaFrame
            },
            sequence_number_enabled: dsm_mask & DSM_CONTENT_MASK_SEQUENCE_NUMBER != 0,
            sequence_number: dsw.sequence_number,
            timestamp_enabled: dsm_mask & DSM_CONTENT_MASK_TIMESTAMP != 0,
            timestamp: if dsm_mask & DSM_CONTENT_MASK_TIMESTAMP != 0 {
                DateTime::now()
            } else {
                DateTime::default()
            },
            picoseconds_enabled: false,
            picoseconds: 0,
            status_enabled: dsm_mask & DSM_CONTENT_MASK_STATUS != 0,
            status: 0,
            config_version_major_enabled: dsm_mask & DSM_CONTENT_MASK_MAJOR_VERSION != 0,
            config_version_major: version.major,
            config_version_minor_enabled: dsm_mask & DSM_CONTENT_MASK_MINOR_VERSION != 0,
            config_version_minor: version.minor,
        };

        Ok(DataSetMessage { header, payload })
    }

    pub(crate) fn dataset_writer_remove(&mut self, id: u32) {
        let Some(dsw) = self.dataset_writers.remove(&id) else { return };
        if let Some(wg) = self.writer_groups.get_mut(&dsw.writer_group) {
            wg.writers.retain(|w| *w != id);
        }
        log::info!("{} DataSetWriter removed", dsw.head.log_id);

        #[cfg(feature = "information-model")]
        self.unrepresent(&dsw.head.node_id);
    }
}

/// Reduce a sampled DataValue to the components selected by the field
/// content mask.
fn shape_field(sampled: &DataValue, mask: u32) -> DataValue {
    DataValue {
        value: sampled.value.clone(),
        status: if mask & FIELD_CONTENT_MASK_STATUS_CODE != 0 { sampled.status } else { None },
        source_timestamp: if mask & FIELD_CONTENT_MASK_SOURCE_TIMESTAMP != 0 {
            sampled.source_timestamp
        } else {
            None
        },
        server_timestamp: if mask & FIELD_CONTENT_MASK_SERVER_TIMESTAMP != 0 {
            sampled.server_timestamp
        } else {
            None
        },
        source_picoseconds: if mask & FIELD_CONTENT_MASK_SOURCE_PICOSECONDS != 0 {
            sampled.source_picoseconds
        } else {
            None
        },
        server_picoseconds: if mask & FIELD_CONTENT_MASK_SERVER_PICOSECONDS != 0 {
            sampled.server_picoseconds
        } else {
            None
        },
    }
}

impl PubSubManager {
    /// Add a DataSetWriter binding `dataset` (may be [`NodeId::NULL`] for a
    /// heartbeat writer) into a WriterGroup.
    pub fn add_dataset_writer(
        &self,
        writer_group: &NodeId,
        dataset: &NodeId,
        cfg: &DataSetWriterConfig,
    ) -> crate::Result<NodeId> {
        let mut psm = self.psm.lock();
        let wg_id = Psm::component_id(writer_group)?;
        if !psm.writer_groups.contains_key(&wg_id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }

        let pds_id = if dataset.is_null() {
            None
        } else {
            let id = Psm::component_id(dataset)?;
            if !psm.published_datasets.contains_key(&id) {
                return Err(StatusCode::BAD_NOT_FOUND);
            }
            Some(id)
        };

        // The writer id must be unique within the group.
        let duplicate = psm.writer_groups[&wg_id]
            .writers
            .iter()
            .filter_map(|w| psm.dataset_writers.get(w))
            .any(|w| w.config.dataset_writer_id == cfg.dataset_writer_id);
        if duplicate {
            return Err(StatusCode::BAD_CONFIGURATION_ERROR);
        }

        let id = psm.generate_id();
        let head = ComponentHead::new(id, ComponentKind::DataSetWriter, &cfg.name);
        psm.check_lifecycle(&head.node_id, ComponentKind::DataSetWriter, false)?;
        let node_id = head.node_id.clone();
        log::info!("{} DataSetWriter created", head.log_id);

        let connected_version = pds_id
            .and_then(|p| psm.published_datasets.get(&p))
            .map(|pds| pds.metadata.configuration_version)
            .unwrap_or_default();

        psm.dataset_writers.insert(
            id,
            DataSetWriter {
                head,
                config: cfg.clone(),
                writer_group: wg_id,
                published_dataset: pds_id,
                connected_version,
                delta_frame_counter: 0,
                last_samples: Vec::new(),
                sequence_number: 0,
            },
        );
        psm.writer_groups.get_mut(&wg_id).expect("present").writers.push(id);

        // Follow the group state.
        psm.dataset_writer_set_state(id, PubSubState::Disabled, StatusCode::GOOD);

        #[cfg(feature = "information-model")]
        psm.represent_dataset_writer(id);

        Ok(node_id)
    }

    pub fn remove_dataset_writer(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        if !psm.dataset_writers.contains_key(&id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        psm.check_lifecycle(node, ComponentKind::DataSetWriter, true)?;
        psm.dataset_writer_remove(id);
        Ok(())
    }

    pub fn enable_dataset_writer(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        if !psm.dataset_writers.contains_key(&id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        psm.dataset_writer_set_state(id, PubSubState::Operational, StatusCode::GOOD);
        Ok(())
    }

    pub fn disable_dataset_writer(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        if !psm.dataset_writers.contains_key(&id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        psm.dataset_writer_set_state(id, PubSubState::Disabled, StatusCode::GOOD);
        Ok(())
    }

    pub fn get_dataset_writer_config(&self, node: &NodeId) -> crate::Result<DataSetWriterConfig> {
        let psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.dataset_writers.get(&id).map(|w| w.config.clone()).ok_or(StatusCode::BAD_NOT_FOUND)
    }

    pub fn get_dataset_writer_state(&self, node: &NodeId) -> crate::Result<PubSubState> {
        let psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.dataset_writers.get(&id).map(|w| w.head.state).ok_or(StatusCode::BAD_NOT_FOUND)
    }

    #[must_use]
    pub fn dataset_writer_count(&self) -> usize {
        self.psm.lock().dataset_writers.len()
    }
}
