// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HMAC-SHA256 signing with a PRF counter-mode keystream cipher.
//!
//! Signatures are plain HMAC-SHA256 over header+payload. Encryption XORs the
//! payload with a keystream derived per 32-byte block as
//! `HMAC(enc_key, key_nonce || message_nonce || block_counter)`, which keeps
//! the ciphertext length equal to the plaintext length as the wire format
//! requires. Encrypt and decrypt are the same operation.
//!
//! Interop deployments that need the standardized AES-CTR PubSub profile can
//! plug their own [`PubSubSecurityPolicy`] implementation into the runtime;
//! the seam is identical.

use super::{PubSubSecurityPolicy, SecurityContext};
use crate::types::StatusCode;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

pub const POLICY_URI_HMAC_STREAM: &str = "https://naskel.com/uapub/policy#Hmac-Sha256-Ctr";

const SIGNING_KEY_LENGTH: usize = 32;
const ENCRYPTING_KEY_LENGTH: usize = 32;
const KEY_NONCE_LENGTH: usize = 4;
const SIGNATURE_SIZE: usize = 32;
const KEYSTREAM_BLOCK: usize = 32;

/// Policy factory. One instance can serve any number of groups.
pub struct HmacStreamPolicy {
    rng: SystemRandom,
}

impl Default for HmacStreamPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl HmacStreamPolicy {
    #[must_use]
    pub fn new() -> Self {
        HmacStreamPolicy { rng: SystemRandom::new() }
    }
}

impl PubSubSecurityPolicy for HmacStreamPolicy {
    fn policy_uri(&self) -> &str {
        POLICY_URI_HMAC_STREAM
    }

    fn signature_size(&self) -> usize {
        SIGNATURE_SIZE
    }

    fn key_lengths(&self) -> (usize, usize, usize) {
        (SIGNING_KEY_LENGTH, ENCRYPTING_KEY_LENGTH, KEY_NONCE_LENGTH)
    }

    fn generate_nonce(&self, out: &mut [u8]) -> crate::Result<()> {
        self.rng.fill(out).map_err(|_| StatusCode::BAD_INTERNAL_ERROR)
    }

    fn new_context(&self) -> Box<dyn SecurityContext> {
        Box::new(HmacStreamContext::default())
    }
}

#[derive(Default)]
struct HmacStreamContext {
    signing_key: Option<hmac::Key>,
    encrypting_key: Option<hmac::Key>,
    key_nonce: Zeroizing<Vec<u8>>,
    message_nonce: Vec<u8>,
}

impl HmacStreamContext {
    fn keystream_xor(&self, data: &mut [u8]) -> crate::Result<()> {
        let key = self.encrypting_key.as_ref().ok_or(StatusCode::BAD_INVALID_STATE)?;
        let mut counter: u32 = 0;
        for chunk in data.chunks_mut(KEYSTREAM_BLOCK) {
            let mut block_input =
                Vec::with_capacity(self.key_nonce.len() + self.message_nonce.len() + 4);
            block_input.extend_from_slice(&self.key_nonce);
            block_input.extend_from_slice(&self.message_nonce);
            block_input.extend_from_slice(&counter.to_le_bytes());
            let block = hmac::sign(key, &block_input);
            for (b, k) in chunk.iter_mut().zip(block.as_ref()) {
                *b ^= k;
            }
            counter += 1;
        }
        Ok(())
    }
}

impl SecurityContext for HmacStreamContext {
    fn set_keys(
        &mut self,
        signing_key: &[u8],
        encrypting_key: &[u8],
        key_nonce: &[u8],
    ) -> crate::Result<()> {
        if signing_key.len() != SIGNING_KEY_LENGTH
            || encrypting_key.len() != ENCRYPTING_KEY_LENGTH
            || key_nonce.len() != KEY_NONCE_LENGTH
        {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        self.signing_key = Some(hmac::Key::new(hmac::HMAC_SHA256, signing_key));
        self.encrypting_key = Some(hmac::Key::new(hmac::HMAC_SHA256, encrypting_key));
        self.key_nonce = Zeroizing::new(key_nonce.to_vec());
        Ok(())
    }

    fn set_message_nonce(&mut self, nonce: &[u8]) -> crate::Result<()> {
        if nonce.is_empty() || nonce.len() > crate::protocol::MAX_NONCE_LENGTH {
            return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
        }
        self.message_nonce = nonce.to_vec();
        Ok(())
    }

    fn sign(&self, data: &[u8], out: &mut [u8]) -> crate::Result<()> {
        let key = self.signing_key.as_ref().ok_or(StatusCode::BAD_INVALID_STATE)?;
        if out.len() != SIGNATURE_SIZE {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        let tag = hmac::sign(key, data);
        out.copy_from_slice(tag.as_ref());
        Ok(())
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> crate::Result<()> {
        let key = self.signing_key.as_ref().ok_or(StatusCode::BAD_INVALID_STATE)?;
        hmac::verify(key, data, signature).map_err(|_| StatusCode::BAD_SECURITY_CHECKS_FAILED)
    }

    fn encrypt(&mut self, data: &mut [u8]) -> crate::Result<()> {
        self.keystream_xor(data)
    }

    fn decrypt(&mut self, data: &mut [u8]) -> crate::Result<()> {
        self.keystream_xor(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with_keys() -> Box<dyn SecurityContext> {
        let policy = HmacStreamPolicy::new();
        let mut ctx = policy.new_context();
        ctx.set_keys(&[1u8; 32], &[2u8; 32], &[3u8; 4]).expect("set keys");
        ctx
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let ctx = context_with_keys();
        let data = b"network message bytes";
        let mut sig = [0u8; 32];
        ctx.sign(data, &mut sig).expect("sign");
        ctx.verify(data, &sig).expect("verify");

        let mut tampered = sig;
        tampered[0] ^= 0xFF;
        assert!(ctx.verify(data, &tampered).is_err());
        assert!(ctx.verify(b"other data", &sig).is_err());
    }

    #[test]
    fn test_encrypt_decrypt_in_place() {
        let mut ctx = context_with_keys();
        ctx.set_message_nonce(&[9u8; 8]).expect("nonce");
        let plain = b"payload payload payload payload payload!".to_vec();
        let mut data = plain.clone();
        ctx.encrypt(&mut data).expect("encrypt");
        assert_ne!(data, plain);
        assert_eq!(data.len(), plain.len());
        ctx.decrypt(&mut data).expect("decrypt");
        assert_eq!(data, plain);
    }

    #[test]
    fn test_different_nonce_different_keystream() {
        let mut ctx = context_with_keys();
        let plain = vec![0u8; 64];

        ctx.set_message_nonce(&[1u8; 8]).expect("nonce");
        let mut a = plain.clone();
        ctx.encrypt(&mut a).expect("encrypt");

        ctx.set_message_nonce(&[2u8; 8]).expect("nonce");
        let mut b = plain;
        ctx.encrypt(&mut b).expect("encrypt");
        assert_ne!(a, b);
    }

    #[test]
    fn test_keys_required() {
        let policy = HmacStreamPolicy::new();
        let mut ctx = policy.new_context();
        let mut sig = [0u8; 32];
        assert!(ctx.sign(b"x", &mut sig).is_err());
        let mut data = vec![0u8; 8];
        assert!(ctx.encrypt(&mut data).is_err());
        assert!(ctx.set_keys(&[0; 4], &[0; 4], &[0; 4]).is_err());
    }

    #[test]
    fn test_nonce_generation() {
        let policy = HmacStreamPolicy::new();
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        policy.generate_nonce(&mut a).expect("nonce");
        policy.generate_nonce(&mut b).expect("nonce");
        // 1 in 2^32 flake odds are acceptable
        assert_ne!(a, b);
    }
}
