// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Subscriber key-material sweep.
//!
//! Every subscriber is processed as its own task; a failure is logged,
//! counted and contained to that subscriber. The sweep returns only once
//! every task has finished.
//!
//! | Stored state                      | Action                               |
//! |-----------------------------------|--------------------------------------|
//! | algorithm 0, serial 0             | envelope-encrypt, persist            |
//! | serial != 0                       | [`KeyRotationEngine::maybe_rewrap`]  |
//! | algorithm != 0, serial 0          | left alone                           |

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backend::transit::TRANSIT_KEY_SERIAL;
use crate::backend::BackendGateway;
use crate::error::SyncError;
use crate::labels;
use crate::metrics;
use crate::rotation::{KeyRotationEngine, RewrapOutcome};
use crate::storage::traits::SubscriberStore;
use crate::subscriber::{derive_aad, KeyStatus, SubscriberKeyState, ALGORITHM_AES256_INTERNAL, ALGORITHM_NONE};

/// What happened to one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberOutcome {
    Encrypted,
    Rewrapped { from: u64, to: u64 },
    Current,
    Skipped(String),
    Failed(String),
}

impl SubscriberOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Encrypted => "encrypted",
            Self::Rewrapped { .. } => "rewrapped",
            Self::Current => "current",
            Self::Skipped(_) => "skipped",
            Self::Failed(_) => "failed",
        }
    }
}

/// Totals for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub total: usize,
    pub encrypted: usize,
    pub rewrapped: usize,
    pub current: usize,
    pub skipped: usize,
    pub failed: usize,
    /// The sweep did not run because the backend was down or disabled.
    pub not_run: bool,
}

impl SweepReport {
    fn not_run() -> Self {
        Self { not_run: true, ..Default::default() }
    }

    fn add(&mut self, outcome: &SubscriberOutcome) {
        self.total += 1;
        match outcome {
            SubscriberOutcome::Encrypted => self.encrypted += 1,
            SubscriberOutcome::Rewrapped { .. } => self.rewrapped += 1,
            SubscriberOutcome::Current => self.current += 1,
            SubscriberOutcome::Skipped(_) => self.skipped += 1,
            SubscriberOutcome::Failed(_) => self.failed += 1,
        }
    }
}

pub struct UserDataSyncEngine {
    gateway: BackendGateway,
    subscribers: Arc<dyn SubscriberStore>,
    rotation: Arc<KeyRotationEngine>,
    internal_label: String,
    permits: Arc<Semaphore>,
}

impl UserDataSyncEngine {
    pub fn new(
        gateway: BackendGateway,
        subscribers: Arc<dyn SubscriberStore>,
        rotation: Arc<KeyRotationEngine>,
        internal_label: impl Into<String>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            gateway,
            subscribers,
            rotation,
            internal_label: internal_label.into(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Sweep every subscriber. Only a failure to list subscribers fails the
    /// sweep as a whole.
    #[tracing::instrument(skip(self), fields(sweep_id = %uuid::Uuid::new_v4()))]
    pub async fn sync_all_subscribers(self: &Arc<Self>) -> Result<SweepReport, SyncError> {
        if !self.gateway.is_enabled() {
            debug!("Key backend disabled, user sweep not run");
            return Ok(SweepReport::not_run());
        }
        if self.gateway.circuit().is_down() {
            self.gateway.circuit().record_rejection("sync_users");
            metrics::record_sweep("users", "skipped");
            warn!("Backend down, user sweep skipped");
            return Ok(SweepReport::not_run());
        }

        let _timer = crate::time_sweep!("users");
        let ids = self.subscribers.list_subscribers().await.map_err(|e| {
            metrics::record_sweep("users", "error");
            error!(error = %e, "Failed to list subscribers");
            SyncError::from(e)
        })?;

        let mut tasks = JoinSet::new();
        for ue_id in ids {
            let engine = Arc::clone(self);
            let permits = Arc::clone(&self.permits);
            tasks.spawn(async move {
                // Closed only if the semaphore is dropped, which the engine prevents.
                let _permit = permits.acquire_owned().await.ok();
                let outcome = engine.process_subscriber(&ue_id).await;
                (ue_id, outcome)
            });
        }

        let mut report = SweepReport::default();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok((ue_id, outcome)) => {
                    match &outcome {
                        SubscriberOutcome::Failed(reason) => {
                            warn!(ue_id = %ue_id, reason = %reason, "Subscriber sync failed")
                        }
                        SubscriberOutcome::Skipped(reason) => {
                            debug!(ue_id = %ue_id, reason = %reason, "Subscriber skipped")
                        }
                        _ => {}
                    }
                    outcome
                }
                Err(e) => {
                    error!(error = %e, "Subscriber task aborted");
                    SubscriberOutcome::Failed(e.to_string())
                }
            };
            metrics::record_subscriber_outcome(outcome.as_str());
            report.add(&outcome);
        }

        metrics::record_sweep("users", if report.failed == 0 { "success" } else { "partial" });
        info!(
            total = report.total,
            encrypted = report.encrypted,
            rewrapped = report.rewrapped,
            failed = report.failed,
            "User sweep complete"
        );
        Ok(report)
    }

    /// Process one subscriber. Never returns an error: everything is folded
    /// into the outcome.
    pub async fn process_subscriber(&self, ue_id: &str) -> SubscriberOutcome {
        let mut state = match self.subscribers.get_key_state(ue_id).await {
            Ok(Some(s)) => s,
            Ok(None) => return SubscriberOutcome::Skipped("subscriber not found".into()),
            Err(e) => return SubscriberOutcome::Failed(e.to_string()),
        };

        match state.status() {
            KeyStatus::Unencrypted => self.encrypt(ue_id, &state).await,
            KeyStatus::Encrypted => match self.rotation.maybe_rewrap(ue_id, &mut state).await {
                Ok(RewrapOutcome::Current { .. }) => SubscriberOutcome::Current,
                Ok(RewrapOutcome::Rewrapped { from, to }) => match self.persist(ue_id, &state).await {
                    Ok(()) => SubscriberOutcome::Rewrapped { from, to },
                    Err(outcome) => outcome,
                },
                Err(e) => SubscriberOutcome::Failed(e.to_string()),
            },
            KeyStatus::Inconsistent => SubscriberOutcome::Skipped(format!(
                "inconsistent state: algorithm {} serial {}",
                state.encryption_algorithm, state.key_serial_reference
            )),
        }
    }

    async fn encrypt(&self, ue_id: &str, state: &SubscriberKeyState) -> SubscriberOutcome {
        if state.permanent_key_value.is_empty() {
            return SubscriberOutcome::Skipped("no permanent key".into());
        }

        let aad = derive_aad(ue_id, 0, ALGORITHM_NONE);
        let ciphertext = match self
            .gateway
            .encrypt(&self.internal_label, state.permanent_key_value.as_bytes(), &aad)
            .await
        {
            Ok(ct) if !ct.is_empty() => ct,
            Ok(_) => return SubscriberOutcome::Failed("backend returned an empty ciphertext".into()),
            // Key stores without envelope encryption keep the value local.
            Err(e @ SyncError::Unsupported { .. }) => return SubscriberOutcome::Skipped(e.to_string()),
            Err(e) => return SubscriberOutcome::Failed(e.to_string()),
        };

        let encrypted = SubscriberKeyState {
            permanent_key_value: ciphertext,
            encryption_algorithm: ALGORITHM_AES256_INTERNAL,
            key_serial_reference: TRANSIT_KEY_SERIAL,
            aad: hex::encode(&aad),
            encryption_key_reference: labels::key_reference(&self.internal_label, TRANSIT_KEY_SERIAL),
        };
        match self.persist(ue_id, &encrypted).await {
            Ok(()) => {
                debug!(ue_id, "Permanent key encrypted");
                SubscriberOutcome::Encrypted
            }
            Err(outcome) => outcome,
        }
    }

    async fn persist(&self, ue_id: &str, state: &SubscriberKeyState) -> Result<(), SubscriberOutcome> {
        self.subscribers
            .update_key_state(ue_id, state)
            .await
            .map_err(|e| SubscriberOutcome::Failed(format!("persist failed: {e}")))
    }
}
