// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Security groups and key rollover.
//!
//! A SecurityGroup owns the key series of one `securityGroupId`. Writer and
//! reader groups configured with that id share the reference-counted
//! [`KeyStorage`]; the rollover timer advances the active key and installs
//! it into every referencing group's crypto context. Keys are served to SKS
//! clients through [`PubSubManager::get_security_keys`] and pushed by an SKS
//! through [`PubSubManager::set_security_keys`].

use super::{Psm, PubSubManager, PubSubState};
use crate::eventloop::{TimerId, TimerPolicy};
use crate::security::keystorage::{KeyStorage, SecurityGroupConfig};
use crate::security::{HmacStreamPolicy, PubSubSecurityPolicy};
use crate::types::{NodeId, StatusCode};
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) struct SecurityGroup {
    pub node_id: NodeId,
    pub config: SecurityGroupConfig,
    pub rollover_timer: TimerId,
}

/// Result of GetSecurityKeys.
#[derive(Debug, Clone)]
pub struct SecurityKeys {
    pub security_policy_uri: String,
    pub first_token_id: u32,
    pub keys: Vec<Vec<u8>>,
    pub time_to_next_key_ms: f64,
    pub key_lifetime_ms: f64,
}

impl Psm {
    fn key_storage(&mut self, security_group_id: &str, policy_uri: &str) -> Arc<Mutex<KeyStorage>> {
        self.key_storages
            .entry(security_group_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(KeyStorage::new(security_group_id, policy_uri)))
            })
            .clone()
    }

    /// Install the storage's current key into every Writer/ReaderGroup that
    /// shares the security group id.
    pub(crate) fn sks_activate_key(&mut self, security_group_id: &str) -> crate::Result<()> {
        let storage = self
            .key_storages
            .get(security_group_id)
            .cloned()
            .ok_or(StatusCode::BAD_NOT_FOUND)?;
        let (token_id, material) = {
            let ks = storage.lock();
            let current = ks.current_key().ok_or(StatusCode::BAD_NO_COMMUNICATION)?;
            (current.key_id, current.material.to_vec())
        };

        let wg_ids: Vec<u32> = self
            .writer_groups
            .iter()
            .filter(|(_, wg)| wg.config.security_group_id == security_group_id)
            .map(|(id, _)| *id)
            .collect();
        for id in wg_ids {
            let recheck = {
                let wg = self.writer_groups.get_mut(&id).expect("present");
                let Some(policy) = wg.config.security_policy.clone() else { continue };
                let (sig, enc, nonce) =
                    KeyStorage::split_material(&material, policy.key_lengths())?;
                let ctx = wg.security_context.get_or_insert_with(|| policy.new_context());
                ctx.set_keys(sig, enc, nonce)?;
                wg.security_token_id = token_id;
                wg.head.state == PubSubState::PreOperational
            };
            if recheck {
                let _ = self.writer_group_set_state(id, PubSubState::PreOperational);
            }
        }

        let rg_ids: Vec<u32> = self
            .reader_groups
            .iter()
            .filter(|(_, rg)| rg.config.security_group_id == security_group_id)
            .map(|(id, _)| *id)
            .collect();
        for id in rg_ids {
            let rg = self.reader_groups.get_mut(&id).expect("present");
            let Some(policy) = rg.config.security_policy.clone() else { continue };
            let (sig, enc, nonce) = KeyStorage::split_material(&material, policy.key_lengths())?;
            let ctx = rg.security_context.get_or_insert_with(|| policy.new_context());
            ctx.set_keys(sig, enc, nonce)?;
            rg.security_token_id = token_id;
        }
        Ok(())
    }

    /// Key-rollover tick: advance the active pointer, install, reschedule at
    /// the key lifetime.
    fn sks_rollover(&mut self, sg_id: u32) {
        let Some(sg) = self.security_groups.get(&sg_id) else { return };
        let group_id = sg.config.security_group_name.clone();
        let timer = sg.rollover_timer;
        let lifetime = sg.config.key_lifetime_ms;

        let advanced = self
            .key_storages
            .get(&group_id)
            .is_some_and(|storage| storage.lock().advance());
        if advanced {
            if let Err(e) = self.sks_activate_key(&group_id) {
                log::warn!("SecurityGroup '{}': key activation failed with {}", group_id, e);
            }
        } else {
            // Exhausted series: the next key request to the SKS refills it.
            log::warn!("SecurityGroup '{}': no future key available", group_id);
        }
        if timer != 0 {
            let _ = self.event_loop.modify_timer(timer, lifetime, TimerPolicy::CurrentTime);
        }
    }

    pub(crate) fn attach_key_storage_to_writer_group(&mut self, wg_id: u32) {
        let group_id = match self.writer_groups.get(&wg_id) {
            Some(wg) if !wg.config.security_group_id.is_empty() => {
                wg.config.security_group_id.clone()
            }
            _ => return,
        };
        if self.key_storages.contains_key(&group_id) {
            let _ = self.sks_activate_key(&group_id);
        }
    }

    pub(crate) fn attach_key_storage_to_reader_group(&mut self, rg_id: u32) {
        let group_id = match self.reader_groups.get(&rg_id) {
            Some(rg) if !rg.config.security_group_id.is_empty() => {
                rg.config.security_group_id.clone()
            }
            _ => return,
        };
        if self.key_storages.contains_key(&group_id) {
            let _ = self.sks_activate_key(&group_id);
        }
    }

    fn generate_key_material(&self, policy: &dyn PubSubSecurityPolicy) -> crate::Result<Vec<u8>> {
        let (sig, enc, nonce) = policy.key_lengths();
        let mut material = vec![0u8; sig + enc + nonce];
        policy.generate_nonce(&mut material)?;
        Ok(material)
    }
}

impl PubSubManager {
    /// Create a SecurityGroup (SKS side): generates the initial key series
    /// and starts the rollover timer.
    pub fn add_security_group(&self, cfg: &SecurityGroupConfig) -> crate::Result<NodeId> {
        let mut psm = self.psm.lock();
        if cfg.security_group_name.is_empty() || cfg.key_lifetime_ms <= 0.0 {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        let duplicate = psm
            .security_groups
            .values()
            .any(|sg| sg.config.security_group_name == cfg.security_group_name);
        if duplicate {
            return Err(StatusCode::BAD_NODE_ID_EXISTS);
        }

        let id = psm.generate_id();
        let node_id = NodeId::numeric(super::PUBSUB_NAMESPACE, id);

        // Seed the key series.
        let policy = HmacStreamPolicy::new();
        let storage = psm.key_storage(&cfg.security_group_name, &cfg.security_policy_uri);
        {
            let mut ks = storage.lock();
            ks.key_lifetime_ms = cfg.key_lifetime_ms;
            ks.time_to_next_key_ms = cfg.key_lifetime_ms;
            ks.max_future_key_count = cfg.max_future_key_count;
            ks.max_past_key_count = cfg.max_past_key_count;
            for key_id in 1..=(1 + cfg.max_future_key_count) {
                let material = psm.generate_key_material(&policy)?;
                ks.push_key(key_id, &material)?;
            }
            ks.set_current(1)?;
        }

        // Rollover timer.
        let weak = psm.self_ref.clone();
        let timer = psm.event_loop.add_timer(
            cfg.key_lifetime_ms,
            Box::new(move || {
                let Some(psm) = weak.upgrade() else { return };
                let mut psm = psm.lock();
                psm.sks_rollover(id);
            }),
        )?;

        log::info!("SecurityGroup '{}' created", cfg.security_group_name);
        psm.security_groups.insert(
            id,
            SecurityGroup { node_id: node_id.clone(), config: cfg.clone(), rollover_timer: timer },
        );

        let group_name = cfg.security_group_name.clone();
        let _ = psm.sks_activate_key(&group_name);
        Ok(node_id)
    }

    pub fn remove_security_group(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        let sg = psm.security_groups.remove(&id).ok_or(StatusCode::BAD_NOT_FOUND)?;
        if sg.rollover_timer != 0 {
            psm.event_loop.remove_timer(sg.rollover_timer);
        }
        psm.key_storages.remove(&sg.config.security_group_name);
        log::info!("SecurityGroup '{}' ({}) removed", sg.config.security_group_name, sg.node_id);
        Ok(())
    }

    /// Push a key series received from a Security Key Service.
    #[allow(clippy::too_many_arguments)] // SetSecurityKeys arguments per Part 14
    pub fn set_security_keys(
        &self,
        security_group_id: &str,
        security_policy_uri: &str,
        current_token_id: u32,
        current_key: &[u8],
        future_keys: &[Vec<u8>],
        time_to_next_key_ms: f64,
        key_lifetime_ms: f64,
    ) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let storage = psm
            .key_storages
            .get(security_group_id)
            .cloned()
            .ok_or(StatusCode::BAD_NOT_FOUND)?;
        {
            let mut ks = storage.lock();
            if ks.policy_uri != security_policy_uri {
                return Err(StatusCode::BAD_SECURITY_POLICY_REJECTED);
            }
            ks.set_keys(
                current_token_id,
                current_key,
                future_keys,
                time_to_next_key_ms,
                key_lifetime_ms,
            )?;
        }
        psm.sks_activate_key(security_group_id)?;

        // Reschedule rollover at timeToNextKey.
        let timer = psm
            .security_groups
            .values()
            .find(|sg| sg.config.security_group_name == security_group_id)
            .map(|sg| sg.rollover_timer);
        if let Some(timer) = timer {
            if timer != 0 && time_to_next_key_ms > 0.0 {
                let _ =
                    psm.event_loop.modify_timer(timer, time_to_next_key_ms, TimerPolicy::CurrentTime);
            }
        }
        Ok(())
    }

    /// The SKS GetSecurityKeys method. `channel_is_sign_and_encrypt` models
    /// the secure-channel requirement: key material is only handed out over
    /// an encrypted channel.
    pub fn get_security_keys(
        &self,
        security_group_id: &str,
        starting_token_id: u32,
        requested_key_count: u32,
        channel_is_sign_and_encrypt: bool,
    ) -> crate::Result<SecurityKeys> {
        let psm = self.psm.lock();
        if !channel_is_sign_and_encrypt {
            return Err(StatusCode::BAD_SECURITY_MODE_INSUFFICIENT);
        }
        let storage = psm
            .key_storages
            .get(security_group_id)
            .cloned()
            .ok_or(StatusCode::BAD_NOT_FOUND)?;
        let ks = storage.lock();
        let starting = if starting_token_id == 0 {
            ks.current_token_id()
        } else {
            starting_token_id
        };
        let (first_token_id, keys) = ks.key_window(starting, requested_key_count);
        if keys.is_empty() {
            return Err(StatusCode::BAD_NO_COMMUNICATION);
        }
        Ok(SecurityKeys {
            security_policy_uri: ks.policy_uri.clone(),
            first_token_id,
            keys,
            time_to_next_key_ms: ks.time_to_next_key_ms,
            key_lifetime_ms: ks.key_lifetime_ms,
        })
    }

    /// Activate the storage's current key on one WriterGroup.
    pub fn set_writer_group_activate_key(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        let group_id = psm
            .writer_groups
            .get(&id)
            .map(|wg| wg.config.security_group_id.clone())
            .ok_or(StatusCode::BAD_NOT_FOUND)?;
        if group_id.is_empty() {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        psm.sks_activate_key(&group_id)
    }

    /// Activate the storage's current key on one ReaderGroup.
    pub fn set_reader_group_activate_key(&self, node: &NodeId) -> crate::Result<()> {
        let mut psm = self.psm.lock();
        let id = Psm::component_id(node)?;
        let group_id = psm
            .reader_groups
            .get(&id)
            .map(|rg| rg.config.security_group_id.clone())
            .ok_or(StatusCode::BAD_NOT_FOUND)?;
        if group_id.is_empty() {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        psm.sks_activate_key(&group_id)
    }

    #[must_use]
    pub fn security_group_count(&self) -> usize {
        self.psm.lock().security_groups.len()
    }
}
