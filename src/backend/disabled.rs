// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend used when synchronization is turned off.
//!
//! Store/update echo the value back so records stay cleartext; every other
//! key operation is unsupported. The probe always reports healthy so the
//! circuit never trips on a backend that isn't there.

use async_trait::async_trait;

use super::{BackendKey, KeyBackend, ProbeStatus, StoreKeyRequest, StoreKeyResponse};
use crate::error::SyncError;
use crate::key_record::KeyRecord;

#[derive(Debug, Default)]
pub struct DisabledBackend;

impl DisabledBackend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl KeyBackend for DisabledBackend {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn supports_label(&self, _label: &str) -> bool {
        false
    }

    async fn login(&self) -> Result<String, SyncError> {
        Ok(String::new())
    }

    async fn create_key(&self, _label: &str, _serial: u32) -> Result<KeyRecord, SyncError> {
        Err(SyncError::Unsupported { backend: self.name(), operation: "create_key" })
    }

    async fn store_key(&self, req: &StoreKeyRequest) -> Result<StoreKeyResponse, SyncError> {
        Ok(StoreKeyResponse { cipher_key: req.key_value.clone() })
    }

    async fn update_key(&self, req: &StoreKeyRequest) -> Result<StoreKeyResponse, SyncError> {
        Ok(StoreKeyResponse { cipher_key: req.key_value.clone() })
    }

    async fn delete_key(&self, _label: &str, _serial: u32) -> Result<(), SyncError> {
        Ok(())
    }

    async fn list_keys(&self, _label: &str) -> Result<Vec<BackendKey>, SyncError> {
        Ok(Vec::new())
    }

    async fn health_probe(&self) -> ProbeStatus {
        ProbeStatus::Healthy
    }
}
