// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-label reconciliation between the key store and the backend.
//!
//! **Our keys** (internal labels) are owned by the backend: keys it holds
//! that the store lacks are adopted, and when neither side has any key a
//! first batch is generated. Labels are synced one after another.
//!
//! **External keys** are owned by the store: store records carrying
//! material are pushed to the backend. Labels are synced concurrently.
//!
//! Keys present on one side only are reported, and removed when
//! `delete_missing` is set.

use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{BackendGateway, BackendKey};
use crate::error::SyncError;
use crate::key_record::{KeyRecord, RecordKey};
use crate::labels;
use crate::metrics;
use crate::storage::transactional::TransactionalKeyStore;

/// Outcome for one label. Serial numbers per action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSyncReport {
    pub label: String,
    /// Backend keys recorded into the store.
    pub adopted: Vec<u32>,
    /// Keys generated because none existed.
    pub created: Vec<u32>,
    /// Store keys pushed to the backend.
    pub mirrored: Vec<u32>,
    pub missing_in_backend: Vec<u32>,
    pub missing_in_store: Vec<u32>,
    pub deleted: Vec<u32>,
    pub errors: Vec<String>,
    /// Not synced (backend down, disabled, or label unsupported).
    pub skipped: bool,
}

impl LabelSyncReport {
    fn new(label: &str) -> Self {
        Self { label: label.to_string(), ..Default::default() }
    }

    fn skipped(label: &str) -> Self {
        Self { skipped: true, ..Self::new(label) }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn fail(&mut self, what: &str, e: &SyncError) {
        warn!(label = %self.label, error = %e, "{what} failed");
        self.errors.push(format!("{what}: {e}"));
    }

    fn emit_metrics(&self) {
        for (action, serials) in [
            ("adopted", &self.adopted),
            ("created", &self.created),
            ("mirrored", &self.mirrored),
            ("missing_in_backend", &self.missing_in_backend),
            ("missing_in_store", &self.missing_in_store),
            ("deleted", &self.deleted),
        ] {
            if !serials.is_empty() {
                metrics::record_key_sync_action(&self.label, action, serials.len());
            }
        }
    }
}

pub struct KeySyncEngine {
    gateway: BackendGateway,
    store: Arc<TransactionalKeyStore>,
    max_keys_create: u32,
    delete_missing: bool,
}

impl KeySyncEngine {
    pub fn new(
        gateway: BackendGateway,
        store: Arc<TransactionalKeyStore>,
        max_keys_create: u32,
        delete_missing: bool,
    ) -> Self {
        Self { gateway, store, max_keys_create, delete_missing }
    }

    /// `None` when the whole class is skipped.
    fn gate(&self, class: &'static str, labels: &[&str]) -> Option<Vec<LabelSyncReport>> {
        if !self.gateway.is_enabled() {
            debug!(class, "Key backend disabled, key sync not run");
            return Some(labels.iter().map(|l| LabelSyncReport::skipped(l)).collect());
        }
        if self.gateway.circuit().is_down() {
            self.gateway.circuit().record_rejection(class);
            metrics::record_sweep(class, "skipped");
            warn!(class, "Backend down, key sync skipped");
            return Some(labels.iter().map(|l| LabelSyncReport::skipped(l)).collect());
        }
        None
    }

    /// Sync internal labels sequentially.
    #[tracing::instrument(skip(self))]
    pub async fn sync_our_keys(&self) -> Vec<LabelSyncReport> {
        if let Some(skipped) = self.gate("our_keys", &labels::INTERNAL_LABELS) {
            return skipped;
        }
        let _timer = crate::time_sweep!("our_keys");

        let mut reports = Vec::with_capacity(labels::INTERNAL_LABELS.len());
        for label in labels::INTERNAL_LABELS {
            if !self.gateway.supports_label(label) {
                debug!(label, backend = self.gateway.name(), "Label not supported by backend");
                reports.push(LabelSyncReport::skipped(label));
                continue;
            }
            let report = self.sync_internal_label(label).await;
            report.emit_metrics();
            reports.push(report);
        }
        finish("our_keys", &reports);
        reports
    }

    /// Sync external labels concurrently and wait for all of them.
    #[tracing::instrument(skip(self))]
    pub async fn sync_external_keys(&self) -> Vec<LabelSyncReport> {
        if let Some(skipped) = self.gate("external_keys", &labels::EXTERNAL_LABELS) {
            return skipped;
        }
        let _timer = crate::time_sweep!("external_keys");

        let reports = join_all(labels::EXTERNAL_LABELS.iter().map(|label| async move {
            if !self.gateway.supports_label(label) {
                return LabelSyncReport::skipped(label);
            }
            let report = self.sync_external_label(label).await;
            report.emit_metrics();
            report
        }))
        .await;
        finish("external_keys", &reports);
        reports
    }

    /// Both sides of `label`, keyed by serial.
    async fn snapshot(
        &self,
        label: &str,
        report: &mut LabelSyncReport,
    ) -> Option<(BTreeMap<u32, KeyRecord>, BTreeMap<u32, BackendKey>)> {
        let stored = match self.store.list_by_label(label).await {
            Ok(records) => records.into_iter().map(|r| (r.serial, r)).collect(),
            Err(e) => {
                report.fail("list store records", &e);
                return None;
            }
        };
        let remote = match self.gateway.list_keys(label).await {
            Ok(keys) => keys.into_iter().map(|k| (k.serial, k)).collect(),
            Err(e) => {
                report.fail("list backend keys", &e);
                return None;
            }
        };
        Some((stored, remote))
    }

    async fn sync_internal_label(&self, label: &str) -> LabelSyncReport {
        let mut report = LabelSyncReport::new(label);
        let Some((stored, remote)) = self.snapshot(label, &mut report).await else {
            return report;
        };

        if stored.is_empty() && remote.is_empty() {
            self.create_initial_keys(label, &mut report).await;
            return report;
        }

        for (serial, key) in remote.iter().filter(|(s, _)| !stored.contains_key(*s)) {
            let key_type = match key.key_type.map(Ok).unwrap_or_else(|| labels::key_type_for_internal(label)) {
                Ok(t) => t,
                Err(e) => {
                    report.fail("adopt", &e);
                    continue;
                }
            };
            match self.store.create(&KeyRecord::new(*serial, label, key_type, "")).await {
                Ok(()) => report.adopted.push(*serial),
                Err(e) => report.fail("adopt", &e),
            }
        }

        for serial in stored.keys().filter(|s| !remote.contains_key(*s)) {
            report.missing_in_backend.push(*serial);
            if self.delete_missing {
                match self.store.delete(&RecordKey::new(*serial, label)).await {
                    Ok(_) => report.deleted.push(*serial),
                    Err(e) => report.fail("delete stale record", &e),
                }
            }
        }
        report
    }

    async fn create_initial_keys(&self, label: &str, report: &mut LabelSyncReport) {
        for serial in 1..=self.max_keys_create {
            let record = match self.gateway.create_key(label, serial).await {
                Ok(r) => r,
                Err(e) => {
                    report.fail("create key", &e);
                    // Backend refusals are unlikely to clear for the next serial.
                    return;
                }
            };
            match self.store.create(&record).await {
                Ok(()) => {
                    info!(label, serial, "Key created");
                    report.created.push(serial);
                }
                Err(e) => {
                    report.fail("record created key", &e);
                    if let Err(cleanup) = self.gateway.delete_key(label, serial).await {
                        warn!(label, serial, error = %cleanup, "Backend key left without store record");
                    }
                }
            }
        }
    }

    async fn sync_external_label(&self, label: &str) -> LabelSyncReport {
        let mut report = LabelSyncReport::new(label);
        let Some((stored, remote)) = self.snapshot(label, &mut report).await else {
            return report;
        };

        let remote_serials: BTreeSet<u32> = remote.keys().copied().collect();
        // Backend-only keys are judged against this snapshot; records are never added below.
        let stored_serials: BTreeSet<u32> = stored.keys().copied().collect();

        for (serial, record) in stored.into_iter().filter(|(s, _)| !remote_serials.contains(s)) {
            if record.value.is_empty() {
                report.missing_in_backend.push(serial);
                if self.delete_missing {
                    match self.store.delete(&record.key()).await {
                        Ok(_) => report.deleted.push(serial),
                        Err(e) => report.fail("delete stale record", &e),
                    }
                }
                continue;
            }

            let mut mirrored = record;
            if let Err(e) = self.gateway.store_key(&mut mirrored).await {
                report.fail("store key", &e);
                continue;
            }
            // The store must never keep cleartext the backend now holds.
            match self.store.update(&mirrored).await {
                Ok(()) => report.mirrored.push(serial),
                Err(e) => report.fail("record mirrored key", &e),
            }
        }

        for serial in remote_serials.difference(&stored_serials) {
            report.missing_in_store.push(*serial);
            if self.delete_missing {
                match self.gateway.delete_key(label, *serial).await {
                    Ok(()) => report.deleted.push(*serial),
                    Err(e) => report.fail("delete backend key", &e),
                }
            }
        }
        report
    }
}

fn finish(class: &'static str, reports: &[LabelSyncReport]) {
    let failed = reports.iter().filter(|r| !r.is_ok()).count();
    metrics::record_sweep(class, if failed == 0 { "success" } else { "partial" });
    info!(class, labels = reports.len(), failed, "Key sync complete");
}
