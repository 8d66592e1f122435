/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::SystemTime,
};

use aes_gcm_siv::{
    aead::{Aead, KeyInit},
    Aes256GcmSiv, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;

/// Correlation ids are unique per accepted connection within a process
/// lifetime, and unique across restarts because the counter starts at the
/// current time in milliseconds.
pub struct CidGenerator {
    seq: AtomicU64,
}

impl CidGenerator {
    pub fn new() -> Self {
        CidGenerator {
            seq: AtomicU64::new(
                SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map_or(0, |d| d.as_millis() as u64),
            ),
        }
    }

    pub fn generate(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for CidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Seals a correlation id into the opaque token embedded in outbound
/// `Received` headers. Remote peers only see AEAD ciphertext; the operator
/// holding the instance key can map a token back to the session logs.
pub struct ReceivedToken {
    aead: Aes256GcmSiv,
}

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

impl ReceivedToken {
    pub fn new(key: &[u8; 32]) -> Self {
        ReceivedToken {
            aead: Aes256GcmSiv::new(key.into()),
        }
    }

    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(&key)
    }

    pub fn encode(&self, cid: u64) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let mut token = Vec::with_capacity(NONCE_LEN + 8 + TAG_LEN);
        token.extend_from_slice(&nonce);
        match self
            .aead
            .encrypt(Nonce::from_slice(&nonce), &cid.to_be_bytes()[..])
        {
            Ok(sealed) => {
                token.extend_from_slice(&sealed);
                URL_SAFE_NO_PAD.encode(&token)
            }
            Err(_) => String::new(),
        }
    }

    pub fn decode(&self, token: &str) -> Option<u64> {
        let bytes = URL_SAFE_NO_PAD.decode(token).ok()?;
        if bytes.len() != NONCE_LEN + 8 + TAG_LEN {
            return None;
        }
        let plain = self
            .aead
            .decrypt(Nonce::from_slice(&bytes[..NONCE_LEN]), &bytes[NONCE_LEN..])
            .ok()?;
        Some(u64::from_be_bytes(plain.try_into().ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cids_are_monotonic() {
        let gen = CidGenerator::new();
        let a = gen.generate();
        let b = gen.generate();
        assert!(b > a);
    }

    #[test]
    fn received_token_round_trip() {
        let token = ReceivedToken::generate();
        for cid in [1u64, 42, u64::MAX] {
            let encoded = token.encode(cid);
            assert!(!encoded.is_empty());
            assert_eq!(token.decode(&encoded), Some(cid));
        }
    }

    #[test]
    fn received_token_rejects_other_keys() {
        let token = ReceivedToken::generate();
        let other = ReceivedToken::generate();
        let encoded = token.encode(1234);
        assert_eq!(other.decode(&encoded), None);
        assert_eq!(token.decode("not-a-token"), None);
    }
}
