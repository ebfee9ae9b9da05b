// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The closed key-label allow-list.
//!
//! Labels are partitioned into *internal* labels (keys the system creates and
//! manages itself) and *external* labels (operator-provisioned keys mirrored
//! into a backend). Anything else is rejected.

use crate::error::SyncError;
use crate::key_record::KeyType;

pub const K4_ENC_AES128: &str = "K4_ENC_AES128";
pub const K4_ENC_AES256: &str = "K4_ENC_AES256";
pub const K4_ENC_DES: &str = "K4_ENC_DES";
pub const K4_ENC_DES3: &str = "K4_ENC_DES3";

pub const K4_AES: &str = "K4_AES";
pub const K4_DES: &str = "K4_DES";
pub const K4_DES3: &str = "K4_DES3";

/// System-managed labels, in sync order.
pub const INTERNAL_LABELS: [&str; 4] = [K4_ENC_AES128, K4_ENC_AES256, K4_ENC_DES, K4_ENC_DES3];

/// Backend-managed labels.
pub const EXTERNAL_LABELS: [&str; 3] = [K4_AES, K4_DES, K4_DES3];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelClass {
    Internal,
    External,
}

/// Classify a label, or `None` if it is outside the allow-list.
#[must_use]
pub fn classify(label: &str) -> Option<LabelClass> {
    if INTERNAL_LABELS.contains(&label) {
        Some(LabelClass::Internal)
    } else if EXTERNAL_LABELS.contains(&label) {
        Some(LabelClass::External)
    } else {
        None
    }
}

#[must_use]
pub fn is_internal(label: &str) -> bool {
    classify(label) == Some(LabelClass::Internal)
}

#[must_use]
pub fn is_external(label: &str) -> bool {
    classify(label) == Some(LabelClass::External)
}

/// Key type generated for an internal label.
pub fn key_type_for_internal(label: &str) -> Result<KeyType, SyncError> {
    match label {
        K4_ENC_AES128 => Ok(KeyType::Aes128),
        K4_ENC_AES256 => Ok(KeyType::Aes256),
        K4_ENC_DES3 => Ok(KeyType::Des3),
        K4_ENC_DES => Ok(KeyType::Des),
        other => Err(SyncError::UnsupportedLabel(other.to_string())),
    }
}

/// Reference string stored on a subscriber that points at a managed key.
#[must_use]
pub fn key_reference(label: &str, serial: u32) -> String {
    format!("{label}-{serial}")
}

/// Split a `"<label>-<serial>"` backend key name on its last dash.
#[must_use]
pub fn split_key_reference(name: &str) -> Option<(&str, u32)> {
    let (label, serial) = name.rsplit_once('-')?;
    let serial = serial.parse().ok()?;
    Some((label, serial))
}
