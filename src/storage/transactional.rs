// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-phase writes across the primary and cross-reference collections.
//!
//! Every mutation writes the primary collection first and the reference
//! collection second, under a store-wide write lock. If the second write
//! fails, the first is compensated:
//!
//! | Operation | Compensation                         |
//! |-----------|--------------------------------------|
//! | create    | delete the just-created record       |
//! | update    | restore the backup read beforehand   |
//! | delete    | re-insert the just-deleted record    |
//!
//! A clean compensation surfaces as [`SyncError::RolledBack`]. A failed
//! compensation surfaces as [`SyncError::Consistency`] carrying both causes;
//! that is the only outcome requiring manual repair (see
//! [`TransactionalKeyStore::find_orphans`]).
//!
//! Reads hit the primary collection only and take no lock.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::traits::{KeyRecordStore, KeyRefStore, StorageError};
use crate::error::SyncError;
use crate::key_record::{KeyRecord, RecordKey};
use crate::labels;
use crate::metrics;

/// Divergence between the two collections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanReport {
    /// Primary records with no reference entry.
    pub records_without_ref: Vec<RecordKey>,
    /// Reference entries with no primary record.
    pub refs_without_record: Vec<RecordKey>,
}

impl OrphanReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.records_without_ref.is_empty() && self.refs_without_record.is_empty()
    }
}

pub struct TransactionalKeyStore {
    records: Arc<dyn KeyRecordStore>,
    refs: Arc<dyn KeyRefStore>,
    write_lock: Mutex<()>,
}

impl TransactionalKeyStore {
    pub fn new(records: Arc<dyn KeyRecordStore>, refs: Arc<dyn KeyRefStore>) -> Self {
        Self {
            records,
            refs,
            write_lock: Mutex::new(()),
        }
    }

    fn check_label(label: &str) -> Result<(), SyncError> {
        if labels::classify(label).is_none() {
            return Err(SyncError::Validation(format!("label '{label}' is not in the allow-list")));
        }
        Ok(())
    }

    /// Create a record. Fails on duplicate `(serial, label)`.
    pub async fn create(&self, record: &KeyRecord) -> Result<(), SyncError> {
        Self::check_label(&record.label)?;
        let key = record.key();
        let _guard = self.write_lock.lock().await;

        self.records.insert(record).await?;

        if let Err(original) = self.refs.insert_ref(&key).await {
            warn!(key = %key, error = %original, "Reference insert failed, removing primary record");
            let compensation = self.records.delete(&key).await;
            return Err(Self::settle("create", original, compensation));
        }

        debug!(key = %key, "Key record created");
        Ok(())
    }

    /// Replace a record. If no prior record exists the write behaves as an
    /// upsert and compensation removes it again.
    pub async fn update(&self, record: &KeyRecord) -> Result<(), SyncError> {
        Self::check_label(&record.label)?;
        let key = record.key();
        let _guard = self.write_lock.lock().await;

        let backup = self.records.get(&key).await?;

        self.records.put(record).await?;

        if let Err(original) = self.refs.put_ref(&key).await {
            warn!(key = %key, error = %original, "Reference update failed, restoring backup");
            let compensation = match &backup {
                Some(prev) => self.records.put(prev).await,
                None => self.records.delete(&key).await,
            };
            return Err(Self::settle("update", original, compensation));
        }

        debug!(key = %key, "Key record updated");
        Ok(())
    }

    /// Delete a record, returning what was removed.
    pub async fn delete(&self, key: &RecordKey) -> Result<KeyRecord, SyncError> {
        let _guard = self.write_lock.lock().await;

        let original = self
            .records
            .get(key)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("key record {key}")))?;

        self.records.delete(key).await?;

        if let Err(e) = self.refs.delete_ref(key).await {
            warn!(key = %key, error = %e, "Reference delete failed, re-inserting record");
            let compensation = self.records.put(&original).await;
            return Err(Self::settle("delete", e, compensation));
        }

        debug!(key = %key, "Key record deleted");
        Ok(original)
    }

    fn settle(
        operation: &'static str,
        original: StorageError,
        compensation: Result<(), StorageError>,
    ) -> SyncError {
        match compensation {
            Ok(()) => {
                metrics::record_rollback(operation);
                SyncError::RolledBack { operation, source: original }
            }
            Err(compensation) => {
                metrics::record_consistency_error(operation);
                error!(
                    operation,
                    original = %original,
                    compensation = %compensation,
                    "Compensation failed; key store and references have diverged"
                );
                SyncError::Consistency { operation, original, compensation }
            }
        }
    }

    pub async fn get(&self, key: &RecordKey) -> Result<Option<KeyRecord>, SyncError> {
        Ok(self.records.get(key).await?)
    }

    pub async fn list_by_label(&self, label: &str) -> Result<Vec<KeyRecord>, SyncError> {
        Ok(self.records.list_by_label(label).await?)
    }

    pub async fn list_all(&self) -> Result<Vec<KeyRecord>, SyncError> {
        Ok(self.records.list_all().await?)
    }

    /// Compare the two collections. Holds the write lock so the snapshot is
    /// not torn by an in-flight two-phase write.
    pub async fn find_orphans(&self) -> Result<OrphanReport, SyncError> {
        let _guard = self.write_lock.lock().await;

        let records: BTreeSet<RecordKey> =
            self.records.list_all().await?.iter().map(KeyRecord::key).collect();
        let refs: BTreeSet<RecordKey> = self.refs.list_refs().await?.into_iter().collect();

        let report = OrphanReport {
            records_without_ref: records.difference(&refs).cloned().collect(),
            refs_without_record: refs.difference(&records).cloned().collect(),
        };
        if !report.is_clean() {
            warn!(
                records_without_ref = report.records_without_ref.len(),
                refs_without_record = report.refs_without_record.len(),
                "Key store orphans detected"
            );
        }
        Ok(report)
    }
}
