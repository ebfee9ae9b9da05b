// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync coordinator.
//!
//! The [`SyncCoordinator`] ties the engines together and owns admission
//! control: five locks, only ever taken with `try_lock`, so a trigger that
//! would overlap a running operation of the same class is answered
//! [`TriggerOutcome::Busy`] instead of queueing.
//!
//! | Lock          | Taken by                                   |
//! |---------------|--------------------------------------------|
//! | `our_keys`    | full sync, `SYNC_OUR_KEYS`                 |
//! | `external`    | full sync, `SYNC_EXTERNAL_KEYS`            |
//! | `users`       | full sync, `SYNC_USERS`                    |
//! | `check_life`  | rotation, key-life check                   |
//! | `rotation`    | rotation, key-life check                   |
//!
//! A full sync needs all three class locks, so at most one full sweep runs
//! at a time. Ad hoc key CRUD through [`KeyManager`] takes none of them.
//!
//! # Example
//!
//! ```rust,no_run
//! use k4_sync::{K4SyncConfig, SyncCoordinator, SyncMessage};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let coordinator = Arc::new(SyncCoordinator::connect(K4SyncConfig::default()).await.unwrap());
//! let handle = coordinator.clone().spawn();
//!
//! let outcome = handle.request(SyncMessage::parse("SYNC_USERS")).await.unwrap();
//! println!("{outcome:?}");
//!
//! handle.shutdown().await;
//! # }
//! ```

mod dispatch;
mod lifecycle;
mod types;

pub use lifecycle::CoordinatorHandle;
pub use types::{FullSyncReport, SyncAction, SyncMessage, TriggerOutcome};

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backend::{BackendGateway, KeyBackend};
use crate::config::K4SyncConfig;
use crate::error::SyncError;
use crate::health::HealthMonitor;
use crate::key_sync::{KeySyncEngine, LabelSyncReport};
use crate::keys::KeyManager;
use crate::labels;
use crate::metrics;
use crate::resilience::circuit::CircuitState;
use crate::rotation::KeyRotationEngine;
use crate::storage::traits::SubscriberStore;
use crate::storage::transactional::TransactionalKeyStore;
use crate::user_sync::UserDataSyncEngine;

#[derive(Default)]
struct AdmissionLocks {
    external: Mutex<()>,
    our_keys: Mutex<()>,
    users: Mutex<()>,
    check_life: Mutex<()>,
    rotation: Mutex<()>,
}

pub struct SyncCoordinator {
    config: K4SyncConfig,
    gateway: BackendGateway,
    health: Arc<HealthMonitor>,
    key_sync: KeySyncEngine,
    users: Arc<UserDataSyncEngine>,
    rotation: Arc<KeyRotationEngine>,
    keys: KeyManager,
    store: Arc<TransactionalKeyStore>,
    locks: AdmissionLocks,
}

impl SyncCoordinator {
    /// Wire the engines around one backend and one set of stores.
    pub fn new(
        config: K4SyncConfig,
        backend: Arc<dyn KeyBackend>,
        store: Arc<TransactionalKeyStore>,
        subscribers: Arc<dyn SubscriberStore>,
    ) -> Self {
        let circuit = Arc::new(CircuitState::new());
        let gateway = BackendGateway::new(backend, circuit, config.call_timeout());

        let health = Arc::new(HealthMonitor::new(gateway.clone(), config.health_check_interval()));
        let rotation = Arc::new(KeyRotationEngine::new(gateway.clone(), config.internal_key_label.clone()));
        let users = Arc::new(UserDataSyncEngine::new(
            gateway.clone(),
            subscribers,
            rotation.clone(),
            config.internal_key_label.clone(),
            config.max_concurrent_subscribers,
        ));
        let key_sync = KeySyncEngine::new(
            gateway.clone(),
            store.clone(),
            config.max_keys_create,
            config.delete_missing,
        );
        let keys = KeyManager::new(gateway.clone(), store.clone());

        Self {
            config,
            gateway,
            health,
            key_sync,
            users,
            rotation,
            keys,
            store,
            locks: AdmissionLocks::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &K4SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn circuit(&self) -> &Arc<CircuitState> {
        self.gateway.circuit()
    }

    #[must_use]
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Ad hoc key CRUD.
    #[must_use]
    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    #[must_use]
    pub fn store(&self) -> &Arc<TransactionalKeyStore> {
        &self.store
    }

    /// Full pass: our keys, then external keys (labels concurrently), then
    /// users. Busy if any class is already running.
    #[tracing::instrument(skip(self))]
    pub async fn trigger_sync(&self) -> TriggerOutcome {
        let guards = (
            self.locks.our_keys.try_lock(),
            self.locks.external.try_lock(),
            self.locks.users.try_lock(),
        );
        let (Ok(_our_keys), Ok(_external), Ok(_users)) = guards else {
            metrics::record_busy("sync");
            warn!("Sync already in progress");
            return TriggerOutcome::Busy;
        };

        let _timer = crate::time_sweep!("full");
        let our_keys = self.key_sync.sync_our_keys().await;
        let external_keys = self.key_sync.sync_external_keys().await;
        let users = match self.users.sync_all_subscribers().await {
            Ok(report) => report,
            Err(e) => {
                metrics::record_sweep("full", "error");
                return TriggerOutcome::Failed(format!("user sync failed: {e}"));
            }
        };

        metrics::record_sweep("full", "success");
        info!("Full sync complete");
        TriggerOutcome::Completed(Box::new(FullSyncReport { our_keys, external_keys, users }))
    }

    /// Internal labels only. Busy if our-keys sync is running.
    pub async fn trigger_sync_our_keys(&self) -> TriggerOutcome {
        let Ok(_guard) = self.locks.our_keys.try_lock() else {
            metrics::record_busy("our_keys");
            return TriggerOutcome::Busy;
        };
        let our_keys = self.key_sync.sync_our_keys().await;
        Self::key_sync_outcome(FullSyncReport { our_keys, ..Default::default() })
    }

    /// External labels only. Busy if external-keys sync is running.
    pub async fn trigger_sync_external_keys(&self) -> TriggerOutcome {
        let Ok(_guard) = self.locks.external.try_lock() else {
            metrics::record_busy("external_keys");
            return TriggerOutcome::Busy;
        };
        let external_keys = self.key_sync.sync_external_keys().await;
        Self::key_sync_outcome(FullSyncReport { external_keys, ..Default::default() })
    }

    fn key_sync_outcome(report: FullSyncReport) -> TriggerOutcome {
        let failed: Vec<&LabelSyncReport> = report
            .our_keys
            .iter()
            .chain(&report.external_keys)
            .filter(|r| !r.is_ok())
            .collect();
        if !failed.is_empty() {
            warn!(labels = failed.len(), "Key sync finished with errors");
        }
        TriggerOutcome::Completed(Box::new(report))
    }

    /// Subscriber sweep only. Busy if a user sweep is running.
    pub async fn trigger_sync_users(&self) -> TriggerOutcome {
        let Ok(_guard) = self.locks.users.try_lock() else {
            metrics::record_busy("users");
            return TriggerOutcome::Busy;
        };
        match self.users.sync_all_subscribers().await {
            Ok(users) => TriggerOutcome::Completed(Box::new(FullSyncReport { users, ..Default::default() })),
            Err(e) => TriggerOutcome::Failed(format!("user sync failed: {e}")),
        }
    }

    /// Rotate `label`, or the configured internal key. Mutually exclusive
    /// with the key-life check.
    #[tracing::instrument(skip(self))]
    pub async fn trigger_rotation(&self, label: Option<&str>) -> TriggerOutcome {
        let label = label.unwrap_or(&self.config.internal_key_label);
        if !labels::is_internal(label) {
            return TriggerOutcome::Failed(format!("'{label}' is not an internal key label"));
        }

        let guards = (self.locks.check_life.try_lock(), self.locks.rotation.try_lock());
        let (Ok(_check_life), Ok(_rotation)) = guards else {
            metrics::record_busy("rotation");
            return TriggerOutcome::Busy;
        };

        match self.rotation.rotate_key(label).await {
            Ok(()) => TriggerOutcome::Rotated { label: label.to_string() },
            Err(e) => Self::failure("key rotation", e),
        }
    }

    /// Report the backend's current version of the internal key.
    pub async fn trigger_check_key_life(&self) -> TriggerOutcome {
        let guards = (self.locks.check_life.try_lock(), self.locks.rotation.try_lock());
        let (Ok(_check_life), Ok(_rotation)) = guards else {
            metrics::record_busy("check_life");
            return TriggerOutcome::Busy;
        };

        let label = self.config.internal_key_label.as_str();
        match self.rotation.key_version(label).await {
            Ok(version) => TriggerOutcome::KeyLife { label: label.to_string(), version },
            Err(e) => Self::failure("key-life check", e),
        }
    }

    fn failure(what: &str, e: SyncError) -> TriggerOutcome {
        match e {
            SyncError::Unsupported { backend, .. } => {
                TriggerOutcome::NotImplemented(format!("{what} on backend '{backend}'"))
            }
            other => TriggerOutcome::Failed(format!("{what} failed: {other}")),
        }
    }
}
