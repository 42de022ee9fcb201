// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ReaderGroup: receive-side demultiplexing and message security.
//!
//! The Connection delivers raw buffers; the group that owns a matching
//! DataSetReader supplies the security context for signature validation and
//! in-place decryption, then every Reader of every group gets a chance to
//! process the decoded DataSetMessages. Receipt of the first message
//! promotes the group from PreOperational to Operational.

use super::writer_group::MessageEncoding;
use super::{
    ComponentHead, ComponentKind, CustomStateMachine, Psm, PubSubLifecycleState, PubSubManager,
    PubSubState, MAX_CHANNELS,
};
use crate::protocol::uadp::{self, NetworkMessage};
use crate::protocol::EncodingMetaData;
use crate::security::{PubSubSecurityPolicy, SecurityMode};
use crate::transport::{ChannelEvent, ChannelId, ChannelState, ConnectionParams};
use crate::types::encoding::DecodeCtx;
use crate::types::{NodeId, StatusCode};
use std::sync::Arc;

/// Group-specific receive transport settings.
#[derive(Debug, Clone, Default)]
pub enum ReaderGroupTransportSettings {
    #[default]
    None,
    /// MQTT topic to subscribe to.
    Broker { queue_name: String },
}

#[derive(Clone, Default)]
pub struct ReaderGroupConfig {
    pub name: String,
    pub encoding: MessageEncoding,
    pub transport_settings: ReaderGroupTransportSettings,
    pub security_mode: SecurityMode,
    pub security_group_id: String,
    pub security_policy: Option<Arc<dyn PubSubSecurityPolicy>>,
    pub custom_state_machine: Option<CustomStateMachine>,
}

pub(crate) struct ReaderGroup {
    pub head: ComponentHead,
    pub config: ReaderGroupConfig,
    pub connection: u32,
    pub readers: Vec<u32>,

    /// A message arrived since the last connect; gates PreOp -> Operational.
    pub has_received: bool,

    /// Dedicated receive channels (MQTT topic subscriptions).
    pub recv_channels: [ChannelId; MAX_CHANNELS],
    pub delete_flag: bool,

    pub security_token_id: u32,
    pub security_context: Option<Box<dyn crate::security::SecurityContext>>,
}

impl ReaderGroup {
    pub(crate) fn recv_channel_count(&self) -> usize {
        self.recv_channels.iter().filter(|c| **c != 0).count()
    }
}

impl Psm {
    pub(crate) fn reader_group_can_connect(&self, id: u32) -> bool {
        let Some(rg) = self.reader_groups.get(&id) else { return false };
        rg.recv_channel_count() == 0
            && matches!(rg.config.transport_settings, ReaderGroupTransportSettings::Broker { .. })
    }

    fn reader_group_channel_callback(&self, rg_id: u32) -> crate::transport::ChannelCallback {
        let weak = self.self_ref.clone();
        Arc::new(move |ev: &ChannelEvent| {
            let Some(psm) = weak.upgrade() else { return };
            let mut psm = psm.lock();
            psm.reader_group_channel_event(rg_id, ev);
        })
    }

    fn reader_group_channel_event(&mut self, rg_id: u32, ev: &ChannelEvent) {
        match ev.state {
            ChannelState::Closing => {
                let was_operational = {
                    let Some(rg) = self.reader_groups.get_mut(&rg_id) else { return };
                    for slot in &mut rg.recv_channels {
                        if *slot == ev.channel {
                            *slot = 0;
                        }
                    }
                    rg.head.state == PubSubState::Operational && !rg.delete_flag
                };
                if was_operational {
                    let _ = self.reader_group_set_state(rg_id, PubSubState::Operational);
                }
            }
            ChannelState::Established => {
                let conn_id = {
                    let Some(rg) = self.reader_groups.get_mut(&rg_id) else { return };
                    if !rg.recv_channels.contains(&ev.channel) {
                        if let Some(slot) = rg.recv_channels.iter_mut().find(|s| **s == 0) {
                            *slot = ev.channel;
                        }
                    }
                    rg.connection
                };
                let current = self.reader_groups[&rg_id].head.state;
                let _ = self.reader_group_set_state(rg_id, current);
                if !ev.bytes.is_empty() {
                    self.connection_process(conn_id, ev.bytes);
                }
            }
            ChannelState::Opening => {}
        }
    }

    /// Open the group's dedicated receive channel (MQTT subscribe).
    pub(crate) fn reader_group_connect(&mut self, id: u32, validate: bool) -> crate::Result<()> {
        let (conn_id, settings) = {
            let rg = self.reader_groups.get(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
            (rg.connection, rg.config.transport_settings.clone())
        };
        let ReaderGroupTransportSettings::Broker { queue_name } = settings else {
            return Ok(());
        };
        let conn = self.connections.get(&conn_id).ok_or(StatusCode::BAD_NOT_FOUND)?;
        let addr = crate::transport::url::parse_url(&conn.config.address.url)?;
        let cm = self.transport(conn.profile.protocol())?;
        let cb = self.reader_group_channel_callback(id);
        cm.open_connection(
            &ConnectionParams {
                address: addr.host,
                port: addr.port,
                listen: true,
                topic: Some(queue_name),
                subscribe: true,
                validate,
                ..Default::default()
            },
            cb,
        )
    }

    pub(crate) fn reader_group_disconnect(&mut self, id: u32) {
        let Some(rg) = self.reader_groups.get(&id) else { return };
        if rg.recv_channel_count() == 0 {
            return;
        }
        let Some(conn) = self.connections.get(&rg.connection) else { return };
        if let Ok(cm) = self.transport(conn.profile.protocol()) {
            for ch in rg.recv_channels {
                if ch != 0 {
                    cm.close_connection(ch);
                }
            }
        }
    }

    /// ReaderGroup state machine.
    pub(crate) fn reader_group_set_state(
        &mut self,
        id: u32,
        mut target: PubSubState,
    ) -> crate::Result<()> {
        let (node, delete_flag, custom) = {
            let rg = self.reader_groups.get(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
            (rg.head.node_id.clone(), rg.delete_flag, rg.config.custom_state_machine.clone())
        };
        if delete_flag && target != PubSubState::Disabled {
            log::warn!(
                "{} the ReaderGroup is being deleted, it can only be disabled",
                self.reader_groups[&id].head.log_id
            );
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }

        self.run_before_hook(&node, &mut target);

        let (old, was_transient) = {
            let rg = self.reader_groups.get_mut(&id).expect("present");
            let t = rg.head.transient;
            rg.head.transient = true;
            (rg.head.state, t)
        };

        let mut reason = StatusCode::GOOD;
        if let Some(csm) = custom {
            let (new_state, status) = csm(&node, old, target);
            self.reader_groups.get_mut(&id).expect("present").head.state = new_state;
            reason = status;
        } else {
            match target {
                PubSubState::Disabled | PubSubState::Error => {
                    self.reader_groups.get_mut(&id).expect("present").head.state = target;
                    self.reader_group_disconnect(id);
                    self.reader_groups.get_mut(&id).expect("present").has_received = false;
                }
                PubSubState::Paused | PubSubState::PreOperational | PubSubState::Operational => {
                    let connection_state = self
                        .reader_groups
                        .get(&id)
                        .and_then(|rg| self.connections.get(&rg.connection))
                        .map(|c| c.head.state);
                    let rg_cfg_invalid = {
                        let rg = &self.reader_groups[&id];
                        rg.config.encoding == MessageEncoding::Json
                            && rg.config.security_mode != SecurityMode::None
                    };

                    if self.lifecycle != PubSubLifecycleState::Started {
                        if old != PubSubState::Paused {
                            log::warn!(
                                "{} cannot enable the ReaderGroup while the manager is not \
                                 running -> Paused",
                                self.reader_groups[&id].head.log_id
                            );
                        }
                        self.reader_groups.get_mut(&id).expect("present").head.state =
                            PubSubState::Paused;
                        self.reader_group_disconnect(id);
                    } else if connection_state != Some(PubSubState::Operational) {
                        self.reader_groups.get_mut(&id).expect("present").head.state =
                            PubSubState::Paused;
                        self.reader_group_disconnect(id);
                    } else if rg_cfg_invalid {
                        // JSON NetworkMessages with security are rejected.
                        reason = StatusCode::BAD_NOT_SUPPORTED;
                    } else {
                        if self.reader_group_can_connect(id) {
                            if let Err(e) = self.reader_group_connect(id, false) {
                                reason = e;
                            }
                        }
                        if reason.is_good() {
                            let rg = self.reader_groups.get_mut(&id).expect("present");
                            rg.head.state = if rg.has_received {
                                PubSubState::Operational
                            } else {
                                PubSubState::PreOperational
                            };
                        }
                    }
                }
            }
            if reason.is_bad() {
                let rg = self.reader_groups.get_mut(&id).expect("present");
                rg.head.state = PubSubState::Error;
                rg.has_received = false;
                self.reader_group_disconnect(id);
            }
        }

        let new = {
            let rg = self.reader_groups.get_mut(&id).expect("present");
            rg.head.transient = was_transient;
            rg.head.state
        };
        if was_transient {
            return reason.into_result();
        }
        if new == old {
            return reason.into_result();
        }

        let log_id = self.reader_groups[&id].head.log_id.clone();
        self.notify_state_change(&log_id, &node, old, new, reason);

        let readers = self.reader_groups[&id].readers.clone();
        for r in readers {
            if let Some(current) = self.dataset_readers.get(&r).map(|d| d.head.state) {
                self.dataset_reader_set_state(r, current, StatusCode::GOOD);
            }
        }

        self.update_lifecycle();
        reason.into_result()
    }

    /// Field layouts of all readers of the group, keyed by writer id.
    pub(crate) fn reader_group_encoding_metadata(&self, id: u32) -> Vec<EncodingMetaData> {
        let Some(rg) = self.reader_groups.get(&id) else { return Vec::new() };
        rg.readers
            .iter()
            .filter_map(|r| self.dataset_readers.get(r))
            .map(|dsr| EncodingMetaData {
                dataset_writer_id: dsr.config.dataset_writer_id,
                fields: dsr.config.dataset_metadata.fields.clone(),
            })
            .collect()
    }

    /// Let every Reader of the group process the decoded NetworkMessage.
    /// Returns true when at least one Reader claimed it.
    pub(crate) fn reader_group_process(&mut self, id: u32, nm: &NetworkMessage) -> bool {
        {
            let Some(rg) = self.reader_groups.get(&id) else { return false };
            if !matches!(rg.head.state, PubSubState::Operational | PubSubState::PreOperational) {
                return false;
            }
        }

        // First traffic promotes the group.
        let current = {
            let rg = self.reader_groups.get_mut(&id).expect("present");
            rg.has_received = true;
            rg.head.state
        };
        let _ = self.reader_group_set_state(id, current);

        let mut processed = false;
        let readers = self.reader_groups.get(&id).map(|rg| rg.readers.clone()).unwrap_or_default();
        for r in readers {
            let matched = {
                let Some(dsr) = self.dataset_readers.get(&r) else { continue };
                if !matches!(
                    dsr.head.state,
                    PubSubState::Operational | PubSubState::PreOperational
                ) {
                    continue;
                }
                self.dataset_reader_check_identifier(dsr, nm)
            };
            if !matched {
                continue;
            }
            processed = true;

            if !nm.payload_header_enabled {
                if let Some(dsm) = nm.messages.first() {
                    self.dataset_reader_process(r, dsm);
                }
                continue;
            }
            // Process only payloads whose writer id the Reader expects.
            let expect = self
                .dataset_readers
                .get(&r)
                .map(|d| d.config.dataset_writer_id)
                .unwrap_or_default();
            for (i, dsm) in nm.messages.clone().iter().enumerate() {
                if nm.dataset_writer_ids.get(i) == Some(&expect) {
                    self.dataset_reader_process(r, dsm);
                }
            }
        }
        processed
    }

    /// Verify the signature (tail bytes) and decrypt the payload in place.
    /// Returns the logical end of the buffer (signature removed).
    fn reader_group_verify_decrypt(
        &mut self,
        id: u32,
        buffer: &mut [u8],
        header_end: usize,
        nm: &NetworkMessage,
    ) -> crate::Result<usize> {
        let mode = self.reader_groups.get(&id).ok_or(StatusCode::BAD_NOT_FOUND)?
            .config
            .security_mode;
        let is_signed = nm.security_enabled && nm.security_header.message_signed;
        let is_encrypted = nm.security_enabled && nm.security_header.message_encrypted;

        // Wire security weaker than configured -> insufficient; stronger
        // than configured -> rejected.
        let do_validate = match (is_signed, mode.signed()) {
            (true, true) => true,
            (false, false) => false,
            (false, true) => return Err(StatusCode::BAD_SECURITY_MODE_INSUFFICIENT),
            (true, false) => return Err(StatusCode::BAD_SECURITY_MODE_REJECTED),
        };
        let do_decrypt = match (is_encrypted, mode.encrypted()) {
            (true, true) => true,
            (false, false) => false,
            (false, true) => return Err(StatusCode::BAD_SECURITY_MODE_INSUFFICIENT),
            (true, false) => return Err(StatusCode::BAD_SECURITY_MODE_REJECTED),
        };

        if !do_validate && !do_decrypt {
            return Ok(buffer.len());
        }

        let signature_size = {
            let rg = &self.reader_groups[&id];
            rg.config
                .security_policy
                .as_ref()
                .ok_or(StatusCode::BAD_SECURITY_POLICY_REJECTED)?
                .signature_size()
        };
        let rg = self.reader_groups.get_mut(&id).expect("present");
        let ctx = rg
            .security_context
            .as_mut()
            .ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)?;

        let mut end = buffer.len();
        if do_validate {
            if end < header_end + signature_size {
                return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
            }
            let (data, signature) = buffer.split_at(end - signature_size);
            ctx.verify(data, signature).map_err(|e| {
                log::warn!("PubSub receive: signature invalid");
                e
            })?;
            end -= signature_size;
        }
        if do_decrypt {
            ctx.set_message_nonce(&nm.security_header.nonce)?;
            ctx.decrypt(&mut buffer[header_end..end])?;
        }
        Ok(end)
    }

    /// Decode an inbound UADP buffer for the connection: headers, identity
    /// match, verify/decrypt under the matched group's keys, payload.
    fn connection_decode_network_message(
        &mut self,
        rg_ids: &[u32],
        bytes: &[u8],
        nm: &mut NetworkMessage,
    ) -> crate::Result<()> {
        let mut buffer = bytes.to_vec();
        let header_end = {
            let mut ctx = DecodeCtx::new(&buffer);
            uadp::decode::decode_headers(&mut ctx, nm)?;
            ctx.pos()
        };

        // The first matching reader decides which group's security context
        // verifies and decrypts the whole message.
        let mut matched_rg = None;
        'outer: for rg_id in rg_ids {
            let Some(rg) = self.reader_groups.get(rg_id) else { continue };
            if !matches!(rg.head.state, PubSubState::Operational | PubSubState::PreOperational) {
                continue;
            }
            for r in &rg.readers {
                if let Some(dsr) = self.dataset_readers.get(r) {
                    if self.dataset_reader_check_identifier(dsr, nm) {
                        matched_rg = Some(*rg_id);
                        break 'outer;
                    }
                }
            }
        }
        let rg_id = matched_rg.ok_or(StatusCode::BAD_NOT_FOUND)?;

        let logical_end = self.reader_group_verify_decrypt(rg_id, &mut buffer, header_end, nm)?;

        let meta = self.reader_group_encoding_metadata(rg_id);
        let mut ctx = DecodeCtx::new(&buffer[..logical_end]);
        ctx.skip(header_end)?;
        uadp::decode::decode_payload(&mut ctx, nm, &meta)?;
        uadp::decode::decode_footers(&mut ctx, nm)
    }

    /// Demultiplex one received buffer to the connection's ReaderGroups.
    pub(crate) fn connection_process(&mut self, conn_id: u32, bytes: &[u8]) {
        let rg_ids = {
            let Some(c) = self.connections.get(&conn_id) else { return };
            log::trace!("{} processing a received buffer", c.head.log_id);
            c.reader_groups.clone()
        };
        if rg_ids.is_empty() {
            self.connection_unmatched_warning(
                conn_id,
                "Message received without any ReaderGroup.",
            );
            return;
        }

        let encoding = self
            .reader_groups
            .get(&rg_ids[0])
            .map(|rg| rg.config.encoding)
            .unwrap_or_default();

        let mut nm = NetworkMessage::default();
        match encoding {
            MessageEncoding::Uadp => {
                match self.connection_decode_network_message(&rg_ids, bytes, &mut nm) {
                    Ok(()) => {}
                    Err(StatusCode::BAD_NOT_FOUND) => {
                        self.connection_unmatched_warning(
                            conn_id,
                            "Message received that could not be processed.",
                        );
                        return;
                    }
                    Err(e) => {
                        self.connection_unmatched_warning(
                            conn_id,
                            &format!("Decoding a message failed with {}.", e),
                        );
                        return;
                    }
                }
            }
            MessageEncoding::Json => {
                #[cfg(feature = "json-encoding")]
                {
                    let meta = self.reader_group_encoding_metadata(rg_ids[0]);
                    match crate::protocol::json::decode(bytes, &meta) {
                        Ok(decoded) => nm = decoded,
                        Err(e) => {
                            self.connection_unmatched_warning(
                                conn_id,
                                &format!("Decoding a JSON message failed with {}.", e),
                            );
                            return;
                        }
                    }
                }
                #[cfg(not(feature = "json-encoding"))]
                {
                    self.connection_unmatched_warning(conn_id, "JSON support is not enabled.");
                    return;
                }
            }
        }

        let mut processed = false;
        for rg_id in &rg_ids {
            processed |= self.reader_group_process(*rg_id, &nm);
        }
        if !processed {
            self.connection_unmatched_warning(
                conn_id,
                "Message received that could not be processed.",
            );
        }
    }

    pub(crate) fn reader_group_remove(&mut self, id: u32) {
        let Some(rg) = self.reader_groups.get(&id) else { return };
        if rg.recv_channel_count() > 0 {
            self.reader_groups.get_mut(&id).expect("present").delete_flag = true;
            let _ = self.reader_group_set_state(id, PubSubState::Disabled);
        }
        let readers = self.reader_groups[&id].readers.clone();
        for r in readers {
            self.dataset_reader_remove(r);
        }
        let rg = self.reader_groups.remove(&id).expect("present");
        if let Some(conn) = self.connections.get_mut(&rg.connection) {
            conn.reader_groups.retain(|r| *r != id);
        }
        log::info!("{} ReaderGroup removed", rg.head.log_id);

        #[cfg(feature = "information-model")]
        self.unrepresent(&rg.head.node_id);
    }
}

impl PubSubManager {
    /// Add a ReaderGroup under a connection. The group starts Disabled.
    pub fn add_reader_group(
        &self,
        connection: &NodeId,
        cfg: &ReaderGroupConfig,
    ) -> crate::Result<NodeId> {
        let mut psm = self.psm.lock();
        let conn_id = Psm::component_id(connection)?;
        if !psm.connections.contains_key(&conn_id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        if cfg.security_mode != SecurityMode::None && cfg.security_policy.is_none() {
            #[cfg(not(feature = "sks"))]
            return Err(StatusCode::BAD_SECURITY_POLICY_REJECTED);
        }

        let id = psm.generate_id();
        let head = ComponentHead::new(id, ComponentKind::ReaderGroup, &cfg.name);
        psm.check_lifecycle(&head.node_id, ComponentKind::ReaderGroup, false)?;
        let node_id = head.node_id.clone();
        log::info!("{} ReaderGroup created", head.log_id);

        let security_context = cfg.security_policy.as_ref().map(|p| p.new_context());
        psm.reader_groups.insert(
            id,
            ReaderGroup {
                head,
                config: cfg.clone(),
                connection: conn_id,
                readers: Vec::new(),
                has_received: false,
                recv_channels: [0; MAX_CHANNELS],
                delete_flag: false,
                security_token_id: 0,
                security_context,
            },
        );
        psm.connections.get_mut(&conn_id).expect("present").reader_groups.push(id);

        #[cfg(feature = "sks")]
        psm.attach_key_storage_to_reader_group(id);

        #[cfg(feature = "information-model")]
        psm.represent_reader_group(id);

        Ok(node_id)
    }

    pub fn remove_reader_group(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        if !psm.reader_groups.contains_key(&id) {
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        psm.check_lifecycle(node, ComponentKind::ReaderGroup, true)?;
        let _ = psm.reader_group_set_state(id, PubSubState::Disabled);
        psm.reader_group_remove(id);
        Ok(())
    }

    pub fn enable_reader_group(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.reader_group_set_state(id, PubSubState::Operational)
    }

    pub fn disable_reader_group(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.reader_group_set_state(id, PubSubState::Disabled)
    }

    pub fn get_reader_group_config(&self, node: &NodeId) -> crate::Result<ReaderGroupConfig> {
        let psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.reader_groups.get(&id).map(|rg| rg.config.clone()).ok_or(StatusCode::BAD_NOT_FOUND)
    }

    pub fn get_reader_group_state(&self, node: &NodeId) -> crate::Result<PubSubState> {
        let psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        psm.reader_groups.get(&id).map(|rg| rg.head.state).ok_or(StatusCode::BAD_NOT_FOUND)
    }

    /// Install symmetric keys directly (without an SKS).
    pub fn set_reader_group_encryption_keys(
        &self,
        node: &NodeId,
        security_token_id: u32,
        signing_key: &[u8],
        encrypting_key: &[u8],
        key_nonce: &[u8],
    ) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        let rg = psm.reader_groups.get_mut(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
        if rg.config.security_mode == SecurityMode::None {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        let policy = rg
            .config
            .security_policy
            .clone()
            .ok_or(StatusCode::BAD_SECURITY_POLICY_REJECTED)?;
        let ctx = rg.security_context.get_or_insert_with(|| policy.new_context());
        ctx.set_keys(signing_key, encrypting_key, key_nonce)?;
        rg.security_token_id = security_token_id;
        Ok(())
    }

    #[must_use]
    pub fn reader_group_count(&self) -> usize {
        self.psm.lock().reader_groups.len()
    }
}
