// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! WriterGroup: the periodic publisher.
//!
//! Each Operational WriterGroup owns a publish timer. On every tick the
//! group collects one DataSetMessage per Operational writer, sends messages
//! with promoted fields immediately as solo NetworkMessages, batches the
//! rest up to `max_encapsulated_dataset_message_count` per NetworkMessage,
//! and pushes the encoded buffers to the transport. The NetworkMessage
//! sequence number increases only after a successful send.

use super::{
    ComponentHead, ComponentKind, CustomStateMachine, Psm, PubSubLifecycleState, PubSubManager,
    PubSubState,
};
use crate::eventloop::{TimerId, TimerPolicy};
use crate::protocol::uadp::{
    DataSetMessage, GroupHeader, NetworkMessage, OffsetEntry, SecurityHeader,
};
use crate::protocol::{uadp, EncodingMetaData};
use crate::security::{PubSubSecurityPolicy, SecurityMode};
use crate::transport::{ChannelEvent, ChannelId, ChannelState, ConnectionParams};
use crate::types::{DateTime, NodeId, StatusCode};
use std::sync::Arc;

// UadpNetworkMessageContentMask bits (Part 14 Section 6.3.1).
pub const NM_CONTENT_MASK_PUBLISHER_ID: u32 = 0x001;
pub const NM_CONTENT_MASK_GROUP_HEADER: u32 = 0x002;
pub const NM_CONTENT_MASK_WRITER_GROUP_ID: u32 = 0x004;
pub const NM_CONTENT_MASK_GROUP_VERSION: u32 = 0x008;
pub const NM_CONTENT_MASK_NETWORK_MESSAGE_NUMBER: u32 = 0x010;
pub const NM_CONTENT_MASK_SEQUENCE_NUMBER: u32 = 0x020;
pub const NM_CONTENT_MASK_PAYLOAD_HEADER: u32 = 0x040;
pub const NM_CONTENT_MASK_TIMESTAMP: u32 = 0x080;
pub const NM_CONTENT_MASK_PICOSECONDS: u32 = 0x100;
pub const NM_CONTENT_MASK_DATASET_CLASS_ID: u32 = 0x200;
pub const NM_CONTENT_MASK_PROMOTED_FIELDS: u32 = 0x400;

/// Wire encoding of the group's NetworkMessages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageEncoding {
    #[default]
    Uadp,
    Json,
}

/// UADP message settings: which optional header fields are wire-present.
#[derive(Debug, Clone)]
pub struct UadpWriterGroupMessageSettings {
    pub group_version: u32,
    pub content_mask: u32,
}

impl Default for UadpWriterGroupMessageSettings {
    fn default() -> Self {
        UadpWriterGroupMessageSettings {
            group_version: 0,
            content_mask: NM_CONTENT_MASK_PUBLISHER_ID
                | NM_CONTENT_MASK_GROUP_HEADER
                | NM_CONTENT_MASK_WRITER_GROUP_ID
                | NM_CONTENT_MASK_SEQUENCE_NUMBER
                | NM_CONTENT_MASK_PAYLOAD_HEADER,
        }
    }
}

/// Group-specific transport settings. `None` uses the Connection's shared
/// send channel.
#[derive(Debug, Clone, Default)]
pub enum WriterGroupTransportSettings {
    #[default]
    None,
    /// MQTT topic to publish on.
    Broker { queue_name: String },
    /// Dedicated UDP unicast target.
    DatagramUnicast { url: String },
}

#[derive(Clone)]
pub struct WriterGroupConfig {
    pub name: String,
    pub writer_group_id: u16,
    /// Must be > 0.
    pub publishing_interval_ms: f64,
    pub keep_alive_time_ms: f64,
    pub priority: u8,
    pub encoding: MessageEncoding,
    /// DataSetMessages per NetworkMessage; clamped to 1..=255.
    pub max_encapsulated_dataset_message_count: u16,
    pub message_settings: UadpWriterGroupMessageSettings,
    pub transport_settings: WriterGroupTransportSettings,
    pub security_mode: SecurityMode,
    pub security_group_id: String,
    pub security_policy: Option<Arc<dyn PubSubSecurityPolicy>>,
    pub custom_state_machine: Option<CustomStateMachine>,
}

impl Default for WriterGroupConfig {
    fn default() -> Self {
        WriterGroupConfig {
            name: String::new(),
            writer_group_id: 0,
            publishing_interval_ms: 100.0,
            keep_alive_time_ms: 0.0,
            priority: 0,
            encoding: MessageEncoding::Uadp,
            max_encapsulated_dataset_message_count: 0,
            message_settings: UadpWriterGroupMessageSettings::default(),
            transport_settings: WriterGroupTransportSettings::None,
            security_mode: SecurityMode::None,
            security_group_id: String::new(),
            security_policy: None,
            custom_state_machine: None,
        }
    }
}

pub(crate) struct WriterGroup {
    pub head: ComponentHead,
    pub config: WriterGroupConfig,
    pub connection: u32,
    pub writers: Vec<u32>,

    /// Registered publish timer (0 = not scheduled).
    pub publish_callback_id: TimerId,
    /// NetworkMessage sequence number; increased after every sent message.
    pub sequence_number: u16,
    /// Monotonic ticks of the last publish.
    pub last_publish_timestamp: i64,

    /// Dedicated send channel (only with own transport settings).
    pub send_channel: ChannelId,
    pub delete_flag: bool,

    pub security_token_id: u32,
    /// Second half of the message nonce.
    pub nonce_sequence_number: u32,
    pub security_context: Option<Box<dyn crate::security::SecurityContext>>,
}

impl Psm {
    pub(crate) fn writer_group_can_connect(&self, id: u32) -> bool {
        let Some(wg) = self.writer_groups.get(&id) else { return false };
        wg.send_channel == 0
            && !matches!(wg.config.transport_settings, WriterGroupTransportSettings::None)
    }

    fn writer_group_channel_callback(&self, wg_id: u32) -> crate::transport::ChannelCallback {
        let weak = self.self_ref.clone();
        Arc::new(move |ev: &ChannelEvent| {
            let Some(psm) = weak.upgrade() else { return };
            let mut psm = psm.lock();
            psm.writer_group_channel_event(wg_id, ev);
        })
    }

    fn writer_group_channel_event(&mut self, wg_id: u32, ev: &ChannelEvent) {
        match ev.state {
            ChannelState::Closing => {
                let (was_operational, delete_flag) = {
                    let Some(wg) = self.writer_groups.get_mut(&wg_id) else { return };
                    if wg.send_channel == ev.channel {
                        wg.send_channel = 0;
                    }
                    (wg.head.state == PubSubState::Operational, wg.delete_flag)
                };
                if was_operational && !delete_flag {
                    let _ = self.writer_group_set_state(wg_id, PubSubState::Operational);
                }
            }
            ChannelState::Established => {
                let current = {
                    let Some(wg) = self.writer_groups.get_mut(&wg_id) else { return };
                    wg.send_channel = ev.channel;
                    wg.head.state
                };
                let _ = self.writer_group_set_state(wg_id, current);
            }
            ChannelState::Opening => {}
        }
    }

    /// Open the group's dedicated channel (MQTT topic / UDP unicast).
    pub(crate) fn writer_group_connect(&mut self, id: u32, validate: bool) -> crate::Result<()> {
        let (conn_id, settings) = {
            let wg = self.writer_groups.get(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
            (wg.connection, wg.config.transport_settings.clone())
        };
        let conn = self.connections.get(&conn_id).ok_or(StatusCode::BAD_NOT_FOUND)?;
        let profile = conn.profile;
        let conn_url = conn.config.address.url.clone();
        let cm = self.transport(profile.protocol())?;
        let cb = self.writer_group_channel_callback(id);

        let params = match settings {
            WriterGroupTransportSettings::None => return Ok(()),
            WriterGroupTransportSettings::Broker { queue_name } => {
                let addr = crate::transport::url::parse_url(&conn_url)?;
                ConnectionParams {
                    address: addr.host,
                    port: addr.port,
                    topic: Some(queue_name),
                    subscribe: false,
                    validate,
                    ..Default::default()
                }
            }
            WriterGroupTransportSettings::DatagramUnicast { url } => {
                let addr = crate::transport::url::parse_url(&url)?;
                ConnectionParams {
                    address: addr.host,
                    port: addr.port,
                    listen: false,
                    validate,
                    ..Default::default()
                }
            }
        };
        cm.open_connection(&params, cb)
    }

    pub(crate) fn writer_group_disconnect(&mut self, id: u32) {
        let Some(wg) = self.writer_groups.get(&id) else { return };
        if wg.send_channel == 0 {
            return;
        }
        let Some(conn) = self.connections.get(&wg.connection) else { return };
        if let Ok(cm) = self.transport(conn.profile.protocol()) {
            cm.close_connection(wg.send_channel);
        }
    }

    pub(crate) fn writer_group_add_publish_callback(&mut self, id: u32) -> crate::Result<()> {
        let wg = self.writer_groups.get(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
        if wg.publish_callback_id != 0 {
            return Ok(());
        }
        let interval = wg.config.publishing_interval_ms;
        let weak = self.self_ref.clone();
        let timer = self.event_loop.add_timer(
            interval,
            Box::new(move || {
                let Some(psm) = weak.upgrade() else { return };
                let mut psm = psm.lock();
                psm.writer_group_publish_tick(id);
            }),
        )?;
        self.writer_groups.get_mut(&id).expect("present").publish_callback_id = timer;
        Ok(())
    }

    pub(crate) fn writer_group_remove_publish_callback(&mut self, id: u32) {
        let Some(wg) = self.writer_groups.get_mut(&id) else { return };
        if wg.publish_callback_id != 0 {
            let timer = wg.publish_callback_id;
            wg.publish_callback_id = 0;
            self.event_loop.remove_timer(timer);
        }
    }

    /// WriterGroup state machine.
    pub(crate) fn writer_group_set_state(
        &mut self,
        id: u32,
        mut target: PubSubState,
    ) -> crate::Result<()> {
        let (node, delete_flag, custom) = {
            let wg = self.writer_groups.get(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
            (wg.head.node_id.clone(), wg.delete_flag, wg.config.custom_state_machine.clone())
        };
        if delete_flag && target != PubSubState::Disabled {
            log::warn!(
                "{} the WriterGroup is being deleted, it can only be disabled",
                self.writer_groups[&id].head.log_id
            );
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }

        self.run_before_hook(&node, &mut target);

        let (old, was_transient) = {
            let wg = self.writer_groups.get_mut(&id).expect("present");
            let t = wg.head.transient;
            wg.head.transient = true;
            (wg.head.state, t)
        };

        let mut reason = StatusCode::GOOD;
        if let Some(csm) = custom {
            let (new_state, status) = csm(&node, old, target);
            self.writer_groups.get_mut(&id).expect("present").head.state = new_state;
            reason = status;
        } else {
            match target {
                PubSubState::Disabled | PubSubState::Error => {
                    self.writer_groups.get_mut(&id).expect("present").head.state = target;
                    self.writer_group_disconnect(id);
                    self.writer_group_remove_publish_callback(id);
                }
                PubSubState::Paused | PubSubState::PreOperational | PubSubState::Operational => {
                    let connection_state = self
                        .writer_groups
                        .get(&id)
                        .and_then(|wg| self.connections.get(&wg.connection))
                        .map(|c| c.head.state);
                    let wg_cfg_invalid = {
                        let wg = &self.writer_groups[&id];
                        wg.config.encoding == MessageEncoding::Json
                            && wg.config.security_mode != SecurityMode::None
                    };

                    if self.lifecycle != PubSubLifecycleState::Started {
                        if old != PubSubState::Paused {
                            log::warn!(
                                "{} cannot enable the WriterGroup while the manager is not \
                                 running -> Paused",
                                self.writer_groups[&id].head.log_id
                            );
                        }
                        self.writer_groups.get_mut(&id).expect("present").head.state =
                            PubSubState::Paused;
                        self.writer_group_disconnect(id);
                        self.writer_group_remove_publish_callback(id);
                    } else if connection_state != Some(PubSubState::Operational) {
                        self.writer_groups.get_mut(&id).expect("present").head.state =
                            PubSubState::Paused;
                        self.writer_group_disconnect(id);
                        self.writer_group_remove_publish_callback(id);
                    } else if wg_cfg_invalid {
                        // JSON NetworkMessages with security are rejected.
                        reason = StatusCode::BAD_NOT_SUPPORTED;
                    } else {
                        self.writer_groups.get_mut(&id).expect("present").head.state =
                            PubSubState::Operational;

                        if self.writer_group_can_connect(id) {
                            if let Err(e) = self.writer_group_connect(id, false) {
                                reason = e;
                            } else if self.writer_group_can_connect(id) {
                                // Channel still opening.
                                self.writer_groups.get_mut(&id).expect("present").head.state =
                                    PubSubState::PreOperational;
                            }
                        }

                        // Secured group without a key yet: PreOperational.
                        if reason.is_good() {
                            {
                                let wg = self.writer_groups.get_mut(&id).expect("present");
                                if wg.config.security_mode != SecurityMode::None
                                    && wg.security_token_id == 0
                                {
                                    wg.head.state = PubSubState::PreOperational;
                                }
                            }
                            if self.writer_groups[&id].head.state == PubSubState::Operational {
                                if let Err(e) = self.writer_group_add_publish_callback(id) {
                                    reason = e;
                                }
                            }
                        }
                    }
                }
            }
            if reason.is_bad() {
                self.writer_groups.get_mut(&id).expect("present").head.state = PubSubState::Error;
                self.writer_group_disconnect(id);
                self.writer_group_remove_publish_callback(id);
            }
        }

        let new = {
            let wg = self.writer_groups.get_mut(&id).expect("present");
            wg.head.transient = was_transient;
            wg.head.state
        };
        if was_transient {
            return reason.into_result();
        }
        if new == old {
            return reason.into_result();
        }

        let log_id = self.writer_groups[&id].head.log_id.clone();
        self.notify_state_change(&log_id, &node, old, new, reason);

        let writers = self.writer_groups[&id].writers.clone();
        for w in writers {
            if let Some(current) = self.dataset_writers.get(&w).map(|d| d.head.state) {
                let _ = self.dataset_writer_set_state(w, current, StatusCode::GOOD);
            }
        }

        self.update_lifecycle();
        reason.into_result()
    }

    pub(crate) fn writer_group_encoding_metadata(&self, id: u32) -> Vec<EncodingMetaData> {
        let Some(wg) = self.writer_groups.get(&id) else { return Vec::new() };
        wg.writers
            .iter()
            .filter_map(|w| self.dataset_writers.get(w))
            .map(|dsw| EncodingMetaData {
                dataset_writer_id: dsw.config.dataset_writer_id,
                fields: dsw
                    .published_dataset
                    .and_then(|p| self.published_datasets.get(&p))
                    .map(|pds| pds.metadata.fields.clone())
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// Build the NetworkMessage skeleton for a set of DataSetMessages.
    fn writer_group_generate_nm(
        &mut self,
        id: u32,
        writer_ids: Vec<u16>,
        messages: Vec<DataSetMessage>,
        promoted: Vec<crate::types::Variant>,
    ) -> crate::Result<NetworkMessage> {
        let wg = self.writer_groups.get(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
        let conn = self.connections.get(&wg.connection).ok_or(StatusCode::BAD_NOT_FOUND)?;
        let mask = wg.config.message_settings.content_mask;

        let mut nm = NetworkMessage::new();
        nm.publisher_id_enabled = mask & NM_CONTENT_MASK_PUBLISHER_ID != 0;
        nm.publisher_id =
            if nm.publisher_id_enabled { Some(conn.publisher_id.clone()) } else { None };
        nm.group_header_enabled = mask & NM_CONTENT_MASK_GROUP_HEADER != 0;
        nm.group_header = GroupHeader {
            writer_group_id_enabled: mask & NM_CONTENT_MASK_WRITER_GROUP_ID != 0,
            group_version_enabled: mask & NM_CONTENT_MASK_GROUP_VERSION != 0,
            network_message_number_enabled: mask & NM_CONTENT_MASK_NETWORK_MESSAGE_NUMBER != 0,
            sequence_number_enabled: mask & NM_CONTENT_MASK_SEQUENCE_NUMBER != 0,
            writer_group_id: wg.config.writer_group_id,
            group_version: wg.config.message_settings.group_version,
            network_message_number: 1,
            sequence_number: wg.sequence_number,
        };
        nm.payload_header_enabled = mask & NM_CONTENT_MASK_PAYLOAD_HEADER != 0;
        nm.timestamp_enabled = mask & NM_CONTENT_MASK_TIMESTAMP != 0;
        if nm.timestamp_enabled {
            nm.timestamp = DateTime::now();
        }
        nm.picoseconds_enabled = mask & NM_CONTENT_MASK_PICOSECONDS != 0;
        nm.promoted_fields_enabled =
            mask & NM_CONTENT_MASK_PROMOTED_FIELDS != 0 && !promoted.is_empty();
        nm.promoted_fields = if nm.promoted_fields_enabled { promoted } else { Vec::new() };
        nm.dataset_writer_ids = writer_ids;
        nm.messages = messages;

        if wg.config.security_mode != SecurityMode::None {
            let policy = wg
                .config
                .security_policy
                .clone()
                .ok_or(StatusCode::BAD_SECURITY_POLICY_REJECTED)?;
            let mut nonce = vec![0u8; 8];
            policy.generate_nonce(&mut nonce[..4])?;
            nonce[4..].copy_from_slice(&wg.nonce_sequence_number.to_le_bytes());
            nm.security_enabled = true;
            nm.security_header = SecurityHeader {
                message_signed: true,
                message_encrypted: wg.config.security_mode == SecurityMode::SignAndEncrypt,
                footer_enabled: false,
                force_key_reset: false,
                token_id: wg.security_token_id,
                nonce,
            };
        }

        Ok(nm)
    }

    fn writer_group_stamp_publish_time(&mut self, id: u32) {
        let now = self.event_loop.now_monotonic();
        if let Some(wg) = self.writer_groups.get_mut(&id) {
            wg.last_publish_timestamp = now;
        }
    }

    /// Encode, secure and hand one NetworkMessage to the transport.
    fn writer_group_send(&mut self, id: u32, batch: &[(u16, DataSetMessage)]) {
        if batch.len() > crate::protocol::MAX_DSM_COUNT {
            let log_id = self.writer_groups[&id].head.log_id.clone();
            log::error!("{} more DataSetMessages than a NetworkMessage can carry", log_id);
            let _ = self.writer_group_set_state(id, PubSubState::Error);
            return;
        }

        let res = self.writer_group_send_inner(id, batch);
        if let Err(e) = res {
            let (log_id, conn_id) = {
                let Some(wg) = self.writer_groups.get(&id) else { return };
                (wg.head.log_id.clone(), wg.connection)
            };
            log::error!("{} sending NetworkMessage failed with {}", log_id, e);
            let _ = self.writer_group_set_state(id, PubSubState::Error);
            if e == StatusCode::BAD_CONNECTION_CLOSED || e == StatusCode::BAD_COMMUNICATION_ERROR {
                let _ = self.connection_set_state(conn_id, PubSubState::Error);
            }
        }
    }

    fn writer_group_send_inner(
        &mut self,
        id: u32,
        batch: &[(u16, DataSetMessage)],
    ) -> crate::Result<()> {
        let encoding = self.writer_groups.get(&id).ok_or(StatusCode::BAD_NOT_FOUND)?
            .config
            .encoding;
        match encoding {
            MessageEncoding::Uadp => self.writer_group_send_binary(id, batch, None),
            MessageEncoding::Json => {
                #[cfg(feature = "json-encoding")]
                {
                    self.writer_group_send_json(id, batch)
                }
                #[cfg(not(feature = "json-encoding"))]
                {
                    Err(StatusCode::BAD_NOT_SUPPORTED)
                }
            }
        }
    }

    /// Binary send path; also drives the offset-table computation (with
    /// `offsets` set the message is encoded but not sent).
    pub(crate) fn writer_group_send_binary(
        &mut self,
        id: u32,
        batch: &[(u16, DataSetMessage)],
        mut offsets: Option<&mut Vec<OffsetEntry>>,
    ) -> crate::Result<()> {
        let writer_ids: Vec<u16> = batch.iter().map(|(wid, _)| *wid).collect();
        let messages: Vec<DataSetMessage> = batch.iter().map(|(_, dsm)| dsm.clone()).collect();

        let nm = self.writer_group_generate_nm(id, writer_ids, messages, Vec::new())?;
        let meta = self.writer_group_encoding_metadata(id);

        let (secured, signature_size) = {
            let wg = &self.writer_groups[&id];
            if wg.config.security_mode != SecurityMode::None {
                let policy = wg
                    .config
                    .security_policy
                    .as_ref()
                    .ok_or(StatusCode::BAD_SECURITY_POLICY_REJECTED)?;
                (true, policy.signature_size())
            } else {
                (false, 0)
            }
        };

        let body_size = uadp::encode::calc_size(&nm, &meta)?;
        let msg_size = body_size + signature_size;

        // Select the dedicated channel, falling back to the connection.
        let (channel, protocol) = {
            let wg = &self.writer_groups[&id];
            let conn = self.connections.get(&wg.connection).ok_or(StatusCode::BAD_NOT_FOUND)?;
            let ch = if wg.send_channel != 0 { wg.send_channel } else { conn.send_channel };
            (ch, conn.profile.protocol())
        };
        if channel == 0 && offsets.is_none() {
            let log_id = self.writer_groups[&id].head.log_id.clone();
            log::error!("{} cannot send, no open connection", log_id);
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }

        let cm = self.transport(protocol)?;
        let mut buf = if offsets.is_some() {
            vec![0u8; msg_size]
        } else {
            cm.alloc_network_buffer(channel, msg_size)?
        };

        let layout = uadp::encode::encode(&nm, &meta, &mut buf, offsets.as_deref_mut())?;

        if secured {
            let wg = self.writer_groups.get_mut(&id).expect("present");
            let ctx = wg
                .security_context
                .as_mut()
                .ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)?;
            if nm.security_header.message_encrypted {
                ctx.set_message_nonce(&nm.security_header.nonce)?;
                ctx.encrypt(&mut buf[layout.payload_start..layout.payload_end])?;
            }
            let (signed, tail) = buf.split_at_mut(layout.payload_end);
            ctx.sign(signed, tail)?;
        }

        if offsets.is_some() {
            // Sizing-only pass for the offset table.
            return Ok(());
        }

        cm.send_with_connection(channel, buf)?;

        let wg = self.writer_groups.get_mut(&id).expect("present");
        wg.sequence_number = wg.sequence_number.wrapping_add(1);
        wg.nonce_sequence_number = wg.nonce_sequence_number.wrapping_add(1);
        Ok(())
    }

    #[cfg(feature = "json-encoding")]
    fn writer_group_send_json(
        &mut self,
        id: u32,
        batch: &[(u16, DataSetMessage)],
    ) -> crate::Result<()> {
        let writer_ids: Vec<u16> = batch.iter().map(|(wid, _)| *wid).collect();
        let messages: Vec<DataSetMessage> = batch.iter().map(|(_, dsm)| dsm.clone()).collect();

        let mut nm = self.writer_group_generate_nm(id, writer_ids, messages, Vec::new())?;
        nm.publisher_id_enabled = true;
        if nm.publisher_id.is_none() {
            let wg = &self.writer_groups[&id];
            let conn = self.connections.get(&wg.connection).ok_or(StatusCode::BAD_NOT_FOUND)?;
            nm.publisher_id = Some(conn.publisher_id.clone());
        }
        nm.payload_header_enabled = true;

        let meta = self.writer_group_encoding_metadata(id);
        let payload = crate::protocol::json::encode(&nm, &meta)?;

        let (channel, protocol) = {
            let wg = &self.writer_groups[&id];
            let conn = self.connections.get(&wg.connection).ok_or(StatusCode::BAD_NOT_FOUND)?;
            let ch = if wg.send_channel != 0 { wg.send_channel } else { conn.send_channel };
            (ch, conn.profile.protocol())
        };
        if channel == 0 {
            let log_id = self.writer_groups[&id].head.log_id.clone();
            log::error!("{} cannot send, no open connection", log_id);
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }
        let cm = self.transport(protocol)?;
        cm.send_with_connection(channel, payload)?;

        let wg = self.writer_groups.get_mut(&id).expect("present");
        wg.sequence_number = wg.sequence_number.wrapping_add(1);
        Ok(())
    }

    /// One tick of the publish timer.
    pub(crate) fn writer_group_publish_tick(&mut self, id: u32) {
        let Some(wg) = self.writer_groups.get(&id) else { return };
        log::debug!("{} publish tick", wg.head.log_id);
        if wg.head.state != PubSubState::Operational {
            return;
        }
        if !self.connections.contains_key(&wg.connection) {
            let log_id = wg.head.log_id.clone();
            log::error!("{} publish failed, connection invalid", log_id);
            let _ = self.writer_group_set_state(id, PubSubState::Error);
            return;
        }

        let max_dsm = {
            let m = self.writer_groups[&id].config.max_encapsulated_dataset_message_count as usize;
            m.clamp(1, crate::protocol::MAX_DSM_COUNT)
        };

        let writer_ids = self.writer_groups[&id].writers.clone();
        let mut batch: Vec<(u16, DataSetMessage)> = Vec::with_capacity(writer_ids.len());
        let mut enabled_writers = 0usize;

        for w in writer_ids {
            let Some(dsw) = self.dataset_writers.get(&w) else { continue };
            if dsw.head.state != PubSubState::Operational {
                continue;
            }
            enabled_writers += 1;
            let wire_id = dsw.config.dataset_writer_id;
            let pds_id = dsw.published_dataset;

            let dsm = match self.dataset_writer_generate_dsm(w) {
                Ok(dsm) => dsm,
                Err(e) => {
                    let log_id =
                        self.dataset_writers.get(&w).map(|d| d.head.log_id.clone());
                    log::error!(
                        "{} DataSetMessage creation failed with {}",
                        log_id.unwrap_or_default(),
                        e
                    );
                    self.dataset_writer_set_state(w, PubSubState::Error, e);
                    continue;
                }
            };

            // Promoted fields force a solo NetworkMessage.
            let promoted: Vec<crate::types::Variant> = pds_id
                .and_then(|p| self.published_datasets.get(&p))
                .filter(|pds| pds.promoted_count > 0)
                .map(|pds| Self::promoted_field_values(pds, &dsm))
                .unwrap_or_default();
            if !promoted.is_empty() {
                self.writer_group_stamp_publish_time(id);
                let res = self.writer_group_send_promoted(id, wire_id, dsm, promoted);
                if let Err(e) = res {
                    let log_id = self.writer_groups[&id].head.log_id.clone();
                    log::error!("{} publish of promoted DataSetMessage failed: {}", log_id, e);
                    let _ = self.writer_group_set_state(id, PubSubState::Error);
                    return;
                }
                continue;
            }

            batch.push((wire_id, dsm));
        }

        if enabled_writers == 0 {
            let log_id = self.writer_groups[&id].head.log_id.clone();
            log::warn!("{} cannot publish, no writers are enabled", log_id);
            return;
        }

        for chunk in batch.chunks(max_dsm) {
            self.writer_group_stamp_publish_time(id);
            self.writer_group_send(id, chunk);
            if self.writer_groups.get(&id).map(|wg| wg.head.state)
                != Some(PubSubState::Operational)
            {
                // A failed send pushed the group to Error; stop the batch.
                return;
            }
        }
    }

    fn promoted_field_values(
        pds: &super::PublishedDataSet,
        dsm: &DataSetMessage,
    ) -> Vec<crate::types::Variant> {
        use crate::protocol::uadp::DataSetPayload;
        let DataSetPayload::KeyFrame(fields) = &dsm.payload else {
            return Vec::new();
        };
        pds.metadata
            .fields
            .iter()
            .zip(fields)
            .filter(|(fm, _)| fm.is_promoted())
            .filter_map(|(_, dv)| dv.value.clone())
            .collect()
    }

    fn writer_group_send_promoted(
        &mut self,
        id: u32,
        wire_id: u16,
        dsm: DataSetMessage,
        promoted: Vec<crate::types::Variant>,
    ) -> crate::Result<()> {
        let nm = self.writer_group_generate_nm(id, vec![wire_id], vec![dsm], promoted)?;
        let meta = self.writer_group_encoding_metadata(id);
        self.writer_group_send_nm_binary(id, nm, &meta)
    }

    /// Encode and transmit a fully-populated NetworkMessage.
    fn writer_group_send_nm_binary(
        &mut self,
        id: u32,
        nm: NetworkMessage,
        meta: &[EncodingMetaData],
    ) -> crate::Result<()> {
        let signature_size = {
            let wg = &self.writer_groups[&id];
            if wg.config.security_mode != SecurityMode::None {
                wg.config
                    .security_policy
                    .as_ref()
                    .ok_or(StatusCode::BAD_SECURITY_POLICY_REJECTED)?
                    .signature_size()
            } else {
                0
            }
        };
        let msg_size = uadp::encode::calc_size(&nm, meta)? + signature_size;

        let (channel, protocol) = {
            let wg = &self.writer_groups[&id];
            let conn = self.connections.get(&wg.connection).ok_or(StatusCode::BAD_NOT_FOUND)?;
            let ch = if wg.send_channel != 0 { wg.send_channel } else { conn.send_channel };
            (ch, conn.profile.protocol())
        };
        if channel == 0 {
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }
        let cm = self.transport(protocol)?;
        let mut buf = cm.alloc_network_buffer(channel, msg_size)?;
        let layout = uadp::encode::encode(&nm, meta, &mut buf, None)?;

        if signature_size > 0 {
            let wg = self.writer_groups.get_mut(&id).expect("present");
            let ctx = wg
                .security_context
                .as_mut()
                .ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)?;
            if nm.security_header.message_encrypted {
                ctx.set_message_nonce(&nm.security_header.nonce)?;
                ctx.encrypt(&mut buf[layout.payload_start..layout.payload_end])?;
            }
            let (signed, tail) = buf.split_at_mut(layout.payload_end);
            ctx.sign(signed, tail)?;
        }

        cm.send_with_connection(channel, buf)?;
        let wg = self.writer_groups.get_mut(&id).expect("present");
        wg.sequence_number = wg.sequence_number.wrapping_add(1);
        wg.nonce_sequence_number = wg.nonce_sequence_number.wrapping_add(1);
        Ok(())
    }

    pub(crate) fn writer_group_remove(&mut self, id: u32) {
        let Some(wg) = self.writer_groups.get(&id) else { return };
        if wg.send_channel != 0 {
            self.writer_groups.get_mut(&id).expect("present").delete_flag = true;
            let _ = self.writer_group_set_state(id, PubSubState::Disabled);
        }
        let writers = self.writer_groups[&id].writers.clone();
        for w in writers {
            self.dataset_writer_remove(w);
        }
        self.writer_group_remove_publish_callback(id);
        let wg = self.writer_groups.remove(&id).expect("present");
        if let Some(conn) = self.connections.get_mut(&wg.connection) {
            conn.writer_groups.retain(|w| *w != id);
        }
        log::info!("{} WriterGroup removed", wg.head.log_id);

        #[cfg(feature = "information-model")]
        self.unrepresent(&wg.head.node_id);
    }
}

impl PubSubManager {
    /// Add a WriterGroup under a connection. The group starts Disabled.
    pub fn add_writer_group(
        &self,
        connection: &NodeId,
        cfg: &WriterGroupConfig,
    ) -> crate::Result<NodeId> {
        let mut psm = self.psm.lock();
        let conn_id = Psm::component_id(connection)?;
        if !psm.connections.contains_key(&conn_id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        if cfg.publishing_interval_ms <= 0.0 || !cfg.publishing_interval_ms.is_finite() {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        if cfg.security_mode != SecurityMode::None && cfg.security_policy.is_none() {
            #[cfg(not(feature = "sks"))]
            return Err(StatusCode::BAD_SECURITY_POLICY_REJECTED);
            // With SKS the policy may arrive later through the key storage.
        }

        let id = psm.generate_id();
        let head = ComponentHead::new(id, ComponentKind::WriterGroup, &cfg.name);
        psm.check_lifecycle(&head.node_id, ComponentKind::WriterGroup, false)?;
        let node_id = head.node_id.clone();
        log::info!("{} WriterGroup created", head.log_id);

        let security_context = cfg.security_policy.as_ref().map(|p| p.new_context());
        psm.writer_groups.insert(
            id,
            WriterGroup {
                head,
                config: cfg.clone(),
                connection: conn_id,
                writers: Vec::new(),
                publish_callback_id: 0,
                sequence_number: 0,
                last_publish_timestamp: 0,
                send_channel: 0,
                delete_flag: false,
                security_token_id: 0,
                nonce_sequence_number: 1,
                security_context,
            },
        );
        psm.connections.get_mut(&conn_id).expect("present").writer_groups.push(id);

        #[cfg(feature = "sks")]
        psm.attach_key_storage_to_writer_group(id);

        #[cfg(feature = "information-model")]
        psm.represent_writer_group(id);

        Ok(node_id)
    }

    pub fn remove_writer_group(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        if !psm.writer_groups.contains_key(&id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        psm.check_lifecycle(node, ComponentKind::WriterGroup, true)?;
        let _ = psm.writer_group_set_state(id, PubSubState::Disabled);
        psm.writer_group_remove(id);
        Ok(())
    }

    pub fn enable_writer_group(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.writer_group_set_state(id, PubSubState::Operational)
    }

    pub fn disable_writer_group(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.writer_group_set_state(id, PubSubState::Disabled)
    }

    pub fn get_writer_group_config(&self, node: &NodeId) -> crate::Result<WriterGroupConfig> {
        let psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.writer_groups.get(&id).map(|wg| wg.config.clone()).ok_or(StatusCode::BAD_NOT_FOUND)
    }

    pub fn get_writer_group_state(&self, node: &NodeId) -> crate::Result<PubSubState> {
        let psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.writer_groups.get(&id).map(|wg| wg.head.state).ok_or(StatusCode::BAD_NOT_FOUND)
    }

    /// Replace the configuration of a non-enabled group.
    pub fn update_writer_group_config(
        &self,
        node: &NodeId,
        cfg: &WriterGroupConfig,
    ) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        if cfg.publishing_interval_ms <= 0.0 || !cfg.publishing_interval_ms.is_finite() {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        let wg = psm.writer_groups.get_mut(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
        if wg.head.state.is_enabled() {
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }
        wg.config = cfg.clone();
        Ok(())
    }

    /// Change the publishing interval; a running group re-registers its
    /// publish timer without stopping.
    pub fn set_writer_group_publishing_interval(
        &self,
        node: &NodeId,
        interval_ms: f64,
    ) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        if interval_ms <= 0.0 || !interval_ms.is_finite() {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        let timer = {
            let wg = psm.writer_groups.get_mut(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
            wg.config.publishing_interval_ms = interval_ms;
            wg.publish_callback_id
        };
        if timer != 0 {
            psm.event_loop.modify_timer(timer, interval_ms, TimerPolicy::CurrentTime)?;
        }
        Ok(())
    }

    /// Publish outside the periodic timer.
    pub fn trigger_writer_group_publish(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        if !psm.writer_groups.contains_key(&id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        psm.writer_group_publish_tick(id);
        Ok(())
    }

    /// Monotonic timestamp (100ns ticks) of the group's last publish.
    pub fn get_writer_group_last_publish_timestamp(&self, node: &NodeId) -> crate::Result<i64> {
        let psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.writer_groups
            .get(&id)
            .map(|wg| wg.last_publish_timestamp)
            .ok_or(StatusCode::BAD_NOT_FOUND)
    }

    /// Install symmetric keys directly (without an SKS).
    pub fn set_writer_group_encryption_keys(
        &self,
        node: &NodeId,
        security_token_id: u32,
        signing_key: &[u8],
        encrypting_key: &[u8],
        key_nonce: &[u8],
    ) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        let current = {
            let wg = psm.writer_groups.get_mut(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
            if wg.config.security_mode == SecurityMode::None {
                return Err(StatusCode::BAD_INVALID_ARGUMENT);
            }
            let policy = wg
                .config
                .security_policy
                .clone()
                .ok_or(StatusCode::BAD_SECURITY_POLICY_REJECTED)?;
            let ctx = wg.security_context.get_or_insert_with(|| policy.new_context());
            ctx.set_keys(signing_key, encrypting_key, key_nonce)?;
            wg.security_token_id = security_token_id;
            wg.head.state
        };

        // A PreOperational group waiting for its first key can go live now.
        if current == PubSubState::PreOperational {
            let _ = psm.writer_group_set_state(id, current);
        }
        Ok(())
    }

    /// Compute the realtime offset table: encode the current state of the
    /// group and report where mutable values sit in the buffer.
    pub fn compute_writer_group_offset_table(
        &self,
        node: &NodeId,
    ) -> crate::Result<Vec<OffsetEntry>> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        if !psm.writer_groups.contains_key(&id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }

        // Freeze the referenced DataSets while the layout is validated.
        let pds_ids: Vec<u32> = psm.writer_groups[&id]
            .writers
            .iter()
            .filter_map(|w| psm.dataset_writers.get(w))
            .filter_map(|dsw| dsw.published_dataset)
            .collect();
        for p in &pds_ids {
            if let Some(pds) = psm.published_datasets.get_mut(p) {
                pds.freeze_count += 1;
            }
        }

        let result = (|| {
            let writer_ids = psm.writer_groups[&id].writers.clone();
            let mut batch = Vec::new();
            for w in writer_ids {
                let wire_id = psm
                    .dataset_writers
                    .get(&w)
                    .map(|d| d.config.dataset_writer_id)
                    .ok_or(StatusCode::BAD_NOT_FOUND)?;
                let dsm = psm.dataset_writer_generate_dsm(w)?;
                batch.push((wire_id, dsm));
            }
            if batch.is_empty() {
                return Err(StatusCode::BAD_NOT_FOUND);
            }
            let mut table = Vec::new();
            psm.writer_group_send_binary(id, &batch, Some(&mut table))?;
            Ok(table)
        })();

        for p in &pds_ids {
            if let Some(pds) = psm.published_datasets.get_mut(p) {
                pds.freeze_count -= 1;
            }
        }
        result
    }

    #[must_use]
    pub fn writer_group_count(&self) -> usize {
        self.psm.lock().writer_groups.len()
    }
}
