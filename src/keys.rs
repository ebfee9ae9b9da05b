// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-key create/update/delete, backend first and store second.
//!
//! These may interleave with a running sweep; each store write is
//! independently two-phase, so no sweep lock is taken.

use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::BackendGateway;
use crate::error::SyncError;
use crate::key_record::{KeyRecord, RecordKey};
use crate::storage::transactional::TransactionalKeyStore;

pub struct KeyManager {
    gateway: BackendGateway,
    store: Arc<TransactionalKeyStore>,
}

impl KeyManager {
    pub fn new(gateway: BackendGateway, store: Arc<TransactionalKeyStore>) -> Self {
        Self { gateway, store }
    }

    /// Serial must be non-zero; value must be hex (lowercased here).
    fn normalize(record: &KeyRecord) -> Result<KeyRecord, SyncError> {
        if record.serial == 0 {
            return Err(SyncError::Validation("key serial must be non-zero".into()));
        }
        if record.value.is_empty() || hex::decode(&record.value).is_err() {
            return Err(SyncError::Validation(format!("key {} value is not hex", record.key())));
        }
        let mut normalized = record.clone();
        normalized.value = record.value.to_ascii_lowercase();
        Ok(normalized)
    }

    /// Returns the record as persisted (value replaced by the backend's
    /// handle when a backend is enabled).
    #[tracing::instrument(skip(self, record), fields(key = %record.key()))]
    pub async fn create_key(&self, record: &KeyRecord) -> Result<KeyRecord, SyncError> {
        let mut record = Self::normalize(record)?;
        let enabled = self.gateway.is_enabled();
        if enabled {
            self.gateway.store_key(&mut record).await?;
        }

        if let Err(e) = self.store.create(&record).await {
            if enabled {
                // Best effort: the backend accepted a key the store did not.
                if let Err(cleanup) = self.gateway.delete_key(&record.label, record.serial).await {
                    warn!(error = %cleanup, "Backend key left without store record");
                }
            }
            return Err(e);
        }
        info!("Key created");
        Ok(record)
    }

    #[tracing::instrument(skip(self, record), fields(key = %record.key()))]
    pub async fn update_key(&self, record: &KeyRecord) -> Result<KeyRecord, SyncError> {
        let mut record = Self::normalize(record)?;
        if self.gateway.is_enabled() {
            self.gateway.update_key(&mut record).await?;
        }
        self.store.update(&record).await?;
        info!("Key updated");
        Ok(record)
    }

    /// Returns the removed record.
    #[tracing::instrument(skip(self))]
    pub async fn delete_key(&self, serial: u32, label: &str) -> Result<KeyRecord, SyncError> {
        if self.gateway.is_enabled() {
            self.gateway.delete_key(label, serial).await?;
        }
        let removed = self.store.delete(&RecordKey::new(serial, label)).await?;
        info!("Key deleted");
        Ok(removed)
    }

    pub async fn get_key(&self, serial: u32, label: &str) -> Result<KeyRecord, SyncError> {
        self.store
            .get(&RecordKey::new(serial, label))
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("key record {label}#{serial}")))
    }

    /// All records, or those under `label`.
    pub async fn list_keys(&self, label: Option<&str>) -> Result<Vec<KeyRecord>, SyncError> {
        match label {
            Some(l) => self.store.list_by_label(l).await,
            None => self.store.list_all().await,
        }
    }
}
