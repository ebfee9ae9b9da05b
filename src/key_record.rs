// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Key records as persisted in the primary collection.
//!
//! The serialized field names (`k4`, `k4_sno`, `key_label`, `key_type`) are
//! the on-disk layout shared with the rest of the console, so they are pinned
//! with serde renames.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// Recognized key types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    #[serde(rename = "AES128")]
    Aes128,
    #[serde(rename = "AES256")]
    Aes256,
    #[serde(rename = "DES")]
    Des,
    #[serde(rename = "DES3")]
    Des3,
}

impl KeyType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Aes128 => "AES128",
            KeyType::Aes256 => "AES256",
            KeyType::Des => "DES",
            KeyType::Des3 => "DES3",
        }
    }

    /// Key size in bits, where the backend needs one.
    #[must_use]
    pub fn bits(&self) -> u32 {
        match self {
            KeyType::Aes128 => 128,
            KeyType::Aes256 => 256,
            KeyType::Des => 64,
            KeyType::Des3 => 192,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AES128" => Ok(KeyType::Aes128),
            "AES256" => Ok(KeyType::Aes256),
            "DES" => Ok(KeyType::Des),
            "DES3" => Ok(KeyType::Des3),
            other => Err(SyncError::Validation(format!("unsupported key type '{other}'"))),
        }
    }
}

/// Identity of a key record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    #[serde(rename = "k4_sno")]
    pub serial: u32,
    #[serde(rename = "key_label")]
    pub label: String,
}

impl RecordKey {
    pub fn new(serial: u32, label: impl Into<String>) -> Self {
        Self { serial, label: label.into() }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.serial)
    }
}

/// A K4 key record. `value` is cleartext when no backend is enabled and a
/// backend handle or ciphertext otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    #[serde(rename = "k4")]
    pub value: String,
    #[serde(rename = "k4_sno")]
    pub serial: u32,
    #[serde(rename = "key_label")]
    pub label: String,
    #[serde(rename = "key_type")]
    pub key_type: KeyType,
}

impl KeyRecord {
    pub fn new(serial: u32, label: impl Into<String>, key_type: KeyType, value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            serial,
            label: label.into(),
            key_type,
        }
    }

    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.serial, self.label.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_persisted_layout() {
        let rec = KeyRecord::new(3, "K4_AES", KeyType::Aes256, "00ff");
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(
            v,
            json!({"k4": "00ff", "k4_sno": 3, "key_label": "K4_AES", "key_type": "AES256"})
        );
        let back: KeyRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_key_type_parse() {
        assert_eq!("DES3".parse::<KeyType>().unwrap(), KeyType::Des3);
        assert!(matches!("RSA".parse::<KeyType>(), Err(SyncError::Validation(_))));
        assert!(matches!("aes128".parse::<KeyType>(), Err(SyncError::Validation(_))));
    }

    #[test]
    fn test_bits() {
        assert_eq!(KeyType::Aes128.bits(), 128);
        assert_eq!(KeyType::Aes256.bits(), 256);
    }
}
