// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message security for PubSub groups.
//!
//! The runtime consumes security through the [`PubSubSecurityPolicy`] seam:
//! a policy creates per-group [`SecurityContext`]s which hold the symmetric
//! keys of the current token and perform signing and in-place encryption
//! over NetworkMessage regions. Key distribution and rollover live in
//! [`keystorage`].

#[cfg(feature = "security")]
mod hmac_stream;
#[cfg(feature = "sks")]
pub mod keystorage;

#[cfg(feature = "security")]
pub use hmac_stream::HmacStreamPolicy;

/// Message security mode of a Writer/ReaderGroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SecurityMode {
    #[default]
    None,
    Sign,
    SignAndEncrypt,
}

impl SecurityMode {
    #[must_use]
    pub fn signed(self) -> bool {
        self != SecurityMode::None
    }

    #[must_use]
    pub fn encrypted(self) -> bool {
        self == SecurityMode::SignAndEncrypt
    }

    /// Wire enum value used by the configuration encoding.
    #[must_use]
    pub fn to_wire(self) -> i32 {
        match self {
            SecurityMode::None => 1,
            SecurityMode::Sign => 2,
            SecurityMode::SignAndEncrypt => 3,
        }
    }

    #[must_use]
    pub fn from_wire(v: i32) -> Self {
        match v {
            2 => SecurityMode::Sign,
            3 => SecurityMode::SignAndEncrypt,
            _ => SecurityMode::None,
        }
    }
}

/// A symmetric security policy shared by groups with the same policy URI.
pub trait PubSubSecurityPolicy: Send + Sync {
    fn policy_uri(&self) -> &str;

    /// Size of the signature appended to signed NetworkMessages.
    fn signature_size(&self) -> usize;

    /// Byte lengths of (signing key, encrypting key, key nonce) as packed in
    /// SKS key material.
    fn key_lengths(&self) -> (usize, usize, usize);

    /// Fill `out` with cryptographically secure random bytes.
    fn generate_nonce(&self, out: &mut [u8]) -> crate::Result<()>;

    /// Create a fresh per-group context (no keys installed yet).
    fn new_context(&self) -> Box<dyn SecurityContext>;
}

/// Per-group crypto state: symmetric keys of the active token plus the
/// per-message nonce.
pub trait SecurityContext: Send {
    /// Install the symmetric keys of a token.
    fn set_keys(
        &mut self,
        signing_key: &[u8],
        encrypting_key: &[u8],
        key_nonce: &[u8],
    ) -> crate::Result<()>;

    /// Set the per-message nonce before encrypt/decrypt.
    fn set_message_nonce(&mut self, nonce: &[u8]) -> crate::Result<()>;

    /// Sign `data`, writing `signature_size` bytes into `out`.
    fn sign(&self, data: &[u8], out: &mut [u8]) -> crate::Result<()>;

    /// Verify a signature over `data`.
    fn verify(&self, data: &[u8], signature: &[u8]) -> crate::Result<()>;

    /// Encrypt the payload region in place (no length change).
    fn encrypt(&mut self, data: &mut [u8]) -> crate::Result<()>;

    /// Decrypt the payload region in place.
    fn decrypt(&mut self, data: &mut [u8]) -> crate::Result<()>;
}
