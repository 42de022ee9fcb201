// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Symmetric key storage for SKS-managed security groups.
//!
//! One [`KeyStorage`] holds the ordered key series of a security group id.
//! Writer and reader groups sharing the id reference the same storage
//! (`Arc`); the active pointer advances on rollover and the new key is
//! installed into every referencing group's crypto context by the manager.

use crate::types::StatusCode;
use std::collections::VecDeque;
use zeroize::Zeroizing;

/// One key of the series. The packed material is
/// `signing_key || encrypting_key || key_nonce` per the policy key lengths.
pub struct KeyItem {
    pub key_id: u32,
    pub material: Zeroizing<Vec<u8>>,
}

/// Configuration of a SecurityGroup (the SKS-side owner of a key series).
#[derive(Debug, Clone)]
pub struct SecurityGroupConfig {
    pub security_group_name: String,
    pub security_policy_uri: String,
    pub key_lifetime_ms: f64,
    pub max_future_key_count: u32,
    pub max_past_key_count: u32,
}

impl Default for SecurityGroupConfig {
    fn default() -> Self {
        SecurityGroupConfig {
            security_group_name: String::new(),
            security_policy_uri: String::new(),
            key_lifetime_ms: 60_000.0,
            max_future_key_count: 10,
            max_past_key_count: 2,
        }
    }
}

/// Ordered key series with an active pointer.
pub struct KeyStorage {
    pub security_group_id: String,
    pub policy_uri: String,
    pub key_lifetime_ms: f64,
    pub time_to_next_key_ms: f64,
    pub max_past_key_count: u32,
    pub max_future_key_count: u32,
    keys: VecDeque<KeyItem>,
    /// Index of the active key in `keys`.
    current: usize,
}

impl KeyStorage {
    #[must_use]
    pub fn new(security_group_id: impl Into<String>, policy_uri: impl Into<String>) -> Self {
        KeyStorage {
            security_group_id: security_group_id.into(),
            policy_uri: policy_uri.into(),
            key_lifetime_ms: 0.0,
            time_to_next_key_ms: 0.0,
            max_past_key_count: 2,
            max_future_key_count: 10,
            keys: VecDeque::new(),
            current: 0,
        }
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn current_key(&self) -> Option<&KeyItem> {
        self.keys.get(self.current)
    }

    #[must_use]
    pub fn current_token_id(&self) -> u32 {
        self.current_key().map_or(0, |k| k.key_id)
    }

    /// Remaining future keys after the active one.
    #[must_use]
    pub fn future_key_count(&self) -> usize {
        self.keys.len().saturating_sub(self.current + 1)
    }

    #[must_use]
    pub fn get_key(&self, key_id: u32) -> Option<&KeyItem> {
        self.keys.iter().find(|k| k.key_id == key_id)
    }

    pub fn clear_keys(&mut self) {
        self.keys.clear();
        self.current = 0;
    }

    /// Append a key at the end of the series. Duplicate ids are rejected.
    pub fn push_key(&mut self, key_id: u32, material: &[u8]) -> crate::Result<()> {
        if self.get_key(key_id).is_some() {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        self.keys.push_back(KeyItem { key_id, material: Zeroizing::new(material.to_vec()) });
        Ok(())
    }

    /// Move the active pointer to `key_id`.
    pub fn set_current(&mut self, key_id: u32) -> crate::Result<()> {
        let idx = self
            .keys
            .iter()
            .position(|k| k.key_id == key_id)
            .ok_or(StatusCode::BAD_NOT_FOUND)?;
        self.current = idx;
        Ok(())
    }

    /// Install a fresh series from the SKS: the current key plus future
    /// keys with consecutive ids (wrapping past `u32::MAX` to 1).
    pub fn set_keys(
        &mut self,
        current_token_id: u32,
        current_key: &[u8],
        future_keys: &[Vec<u8>],
        time_to_next_key_ms: f64,
        key_lifetime_ms: f64,
    ) -> crate::Result<()> {
        if self.get_key(current_token_id).is_none() {
            self.clear_keys();
            self.push_key(current_token_id, current_key)?;
        }
        self.set_current(current_token_id)?;

        let mut next_id = current_token_id;
        for key in future_keys {
            next_id = next_key_id(next_id);
            if self.get_key(next_id).is_none() {
                self.push_key(next_id, key)?;
            }
        }
        self.time_to_next_key_ms = time_to_next_key_ms;
        self.key_lifetime_ms = key_lifetime_ms;
        Ok(())
    }

    /// Rollover: advance the active pointer. Past keys beyond
    /// `max_past_key_count` are discarded. Returns false when no future key
    /// is left (the caller should ask the SKS for more).
    pub fn advance(&mut self) -> bool {
        if self.current + 1 >= self.keys.len() {
            return false;
        }
        self.current += 1;
        while self.current > self.max_past_key_count as usize {
            self.keys.pop_front();
            self.current -= 1;
        }
        true
    }

    /// Key window for GetSecurityKeys: `(first_token_id, keys)`.
    ///
    /// An unknown `starting_token_id` falls back to the oldest held key.
    /// `requested == 0` returns only the starting key; otherwise the
    /// starting key plus up to `min(requested, max_future_key_count)`
    /// following keys.
    #[must_use]
    pub fn key_window(&self, starting_token_id: u32, requested: u32) -> (u32, Vec<Vec<u8>>) {
        let start = self
            .keys
            .iter()
            .position(|k| k.key_id == starting_token_id)
            .unwrap_or(0);
        let Some(first) = self.keys.get(start) else {
            return (0, Vec::new());
        };
        let extra = requested.min(self.max_future_key_count) as usize;
        let keys = self
            .keys
            .iter()
            .skip(start)
            .take(1 + extra)
            .map(|k| k.material.to_vec())
            .collect();
        (first.key_id, keys)
    }

    /// Split packed key material into (signing, encrypting, nonce) parts.
    pub fn split_material<'a>(
        material: &'a [u8],
        lengths: (usize, usize, usize),
    ) -> crate::Result<(&'a [u8], &'a [u8], &'a [u8])> {
        let (sig, enc, nonce) = lengths;
        if material.len() != sig + enc + nonce {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        Ok((&material[..sig], &material[sig..sig + enc], &material[sig + enc..]))
    }
}

fn next_key_id(id: u32) -> u32 {
    if id == u32::MAX {
        1
    } else {
        id + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material(tag: u8) -> Vec<u8> {
        vec![tag; 68]
    }

    #[test]
    fn test_set_keys_and_window() {
        let mut ks = KeyStorage::new("sg1", "policy");
        ks.set_keys(5, &material(5), &[material(6), material(7)], 1000.0, 2000.0)
            .expect("set keys");
        assert_eq!(ks.current_token_id(), 5);
        assert_eq!(ks.key_count(), 3);
        assert_eq!(ks.future_key_count(), 2);

        let (first, keys) = ks.key_window(5, 0);
        assert_eq!(first, 5);
        assert_eq!(keys.len(), 1);

        let (first, keys) = ks.key_window(6, 10);
        assert_eq!(first, 6);
        assert_eq!(keys.len(), 2);

        // unknown starting token: from the oldest held key
        let (first, keys) = ks.key_window(99, 1);
        assert_eq!(first, 5);
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_advance_and_past_trim() {
        let mut ks = KeyStorage::new("sg1", "policy");
        ks.max_past_key_count = 1;
        ks.set_keys(1, &material(1), &[material(2), material(3), material(4)], 0.0, 0.0)
            .expect("set keys");

        assert!(ks.advance());
        assert_eq!(ks.current_token_id(), 2);
        assert!(ks.advance());
        assert_eq!(ks.current_token_id(), 3);
        // only one past key retained
        assert!(ks.get_key(1).is_none());
        assert!(ks.get_key(2).is_some());
        assert!(ks.advance());
        assert!(!ks.advance(), "series exhausted");
    }

    #[test]
    fn test_key_id_wrap() {
        let mut ks = KeyStorage::new("sg1", "policy");
        ks.set_keys(u32::MAX, &material(1), &[material(2)], 0.0, 0.0).expect("set keys");
        assert!(ks.advance());
        assert_eq!(ks.current_token_id(), 1);
    }

    #[test]
    fn test_split_material() {
        let packed = [vec![1u8; 32], vec![2u8; 32], vec![3u8; 4]].concat();
        let (sig, enc, nonce) =
            KeyStorage::split_material(&packed, (32, 32, 4)).expect("split");
        assert_eq!(sig, &[1u8; 32][..]);
        assert_eq!(enc, &[2u8; 32][..]);
        assert_eq!(nonce, &[3u8; 4][..]);
        assert!(KeyStorage::split_material(&packed, (32, 32, 8)).is_err());
    }
}
