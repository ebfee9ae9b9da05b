// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-subscriber key material, as embedded in the subscriber record.

use serde::{Deserialize, Serialize};

/// No encryption applied; the permanent key is cleartext.
pub const ALGORITHM_NONE: i32 = 0;

/// AES-256 envelope encryption under the internal managed key.
pub const ALGORITHM_AES256_INTERNAL: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscriberKeyState {
    pub permanent_key_value: String,
    pub encryption_algorithm: i32,
    pub key_serial_reference: u32,
    /// Hex of the AAD bound to the ciphertext.
    #[serde(default)]
    pub aad: String,
    #[serde(default)]
    pub encryption_key_reference: String,
}

/// Classification used by the user sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Unencrypted,
    /// Bound to a backend key (`serial != 0`), whatever the algorithm marker says.
    Encrypted,
    /// Algorithm marker set without a key serial. Left alone.
    Inconsistent,
}

impl SubscriberKeyState {
    pub fn cleartext(value: impl Into<String>) -> Self {
        Self {
            permanent_key_value: value.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn status(&self) -> KeyStatus {
        match (self.encryption_algorithm, self.key_serial_reference) {
            (ALGORITHM_NONE, 0) => KeyStatus::Unencrypted,
            (_, 0) => KeyStatus::Inconsistent,
            _ => KeyStatus::Encrypted,
        }
    }

    /// AAD bytes for this state, preferring the stored hex and falling back
    /// to re-deriving it when the stored value is missing or not hex.
    #[must_use]
    pub fn aad_bytes(&self, subscriber_id: &str) -> Vec<u8> {
        if !self.aad.is_empty() {
            if let Ok(bytes) = hex::decode(&self.aad) {
                return bytes;
            }
        }
        derive_aad(subscriber_id, self.key_serial_reference, self.encryption_algorithm)
    }
}

/// Deterministic AAD for a subscriber: `"<id>-<serial>-<algorithm>"`.
#[must_use]
pub fn derive_aad(subscriber_id: &str, serial: u32, algorithm: i32) -> Vec<u8> {
    format!("{subscriber_id}-{serial}-{algorithm}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status() {
        assert_eq!(SubscriberKeyState::cleartext("abc").status(), KeyStatus::Unencrypted);

        let enc = SubscriberKeyState {
            permanent_key_value: "vault:v1:xx".into(),
            encryption_algorithm: ALGORITHM_AES256_INTERNAL,
            key_serial_reference: 1,
            ..Default::default()
        };
        assert_eq!(enc.status(), KeyStatus::Encrypted);

        let odd = SubscriberKeyState {
            encryption_algorithm: 5,
            ..Default::default()
        };
        assert_eq!(odd.status(), KeyStatus::Inconsistent);

        let unmarked = SubscriberKeyState {
            permanent_key_value: "vault:v1:xx".into(),
            key_serial_reference: 1,
            ..Default::default()
        };
        assert_eq!(unmarked.status(), KeyStatus::Encrypted);
    }

    #[test]
    fn test_derive_aad_is_deterministic() {
        assert_eq!(derive_aad("imsi-001", 0, 0), b"imsi-001-0-0".to_vec());
        assert_eq!(derive_aad("imsi-001", 0, 0), derive_aad("imsi-001", 0, 0));
        assert_ne!(derive_aad("imsi-001", 0, 0), derive_aad("imsi-002", 0, 0));
    }

    #[test]
    fn test_aad_bytes_falls_back_when_not_hex() {
        let mut state = SubscriberKeyState {
            key_serial_reference: 1,
            encryption_algorithm: ALGORITHM_AES256_INTERNAL,
            aad: hex::encode(b"u-0-0"),
            ..Default::default()
        };
        assert_eq!(state.aad_bytes("u"), b"u-0-0".to_vec());

        state.aad = "zz-not-hex".into();
        assert_eq!(state.aad_bytes("u"), b"u-1-3".to_vec());
    }
}
