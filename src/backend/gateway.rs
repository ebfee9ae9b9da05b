// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The only path from the engines to a backend.
//!
//! Order of checks on every call:
//! 1. label/type validation (no network call on failure)
//! 2. circuit gate (no network call when down)
//! 3. call-level timeout
//! 4. authentication failures trip the circuit
//!
//! The health probe is the one call that bypasses the circuit; it is how
//! the circuit closes again.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{BackendKey, KeyBackend, ProbeStatus, StoreKeyRequest};
use crate::error::SyncError;
use crate::key_record::KeyRecord;
use crate::labels;
use crate::metrics;
use crate::resilience::circuit::CircuitState;

#[derive(Clone)]
pub struct BackendGateway {
    backend: Arc<dyn KeyBackend>,
    circuit: Arc<CircuitState>,
    call_timeout: Duration,
}

impl BackendGateway {
    pub fn new(backend: Arc<dyn KeyBackend>, circuit: Arc<CircuitState>, call_timeout: Duration) -> Self {
        Self { backend, circuit, call_timeout }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.backend.is_enabled()
    }

    #[must_use]
    pub fn supports_label(&self, label: &str) -> bool {
        self.backend.supports_label(label)
    }

    #[must_use]
    pub fn circuit(&self) -> &Arc<CircuitState> {
        &self.circuit
    }

    async fn call<T, Fut>(&self, operation: &'static str, fut: Fut) -> Result<T, SyncError>
    where
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let backend = self.backend.name();

        if self.circuit.is_down() {
            self.circuit.record_rejection(operation);
            metrics::record_backend_call(backend, operation, "rejected");
            debug!(backend, operation, "Backend call rejected, circuit down");
            return Err(SyncError::BackendUnavailable);
        }

        let start = Instant::now();
        let result = match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(SyncError::Timeout(self.call_timeout)),
        };
        metrics::record_backend_latency(backend, operation, start.elapsed());

        let status = match &result {
            Ok(_) => "success",
            Err(SyncError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        metrics::record_backend_call(backend, operation, status);

        if let Err(e) = &result {
            if let SyncError::Auth(reason) = e {
                self.circuit.trip(format!("{operation}: {reason}"));
            }
            warn!(backend, operation, error = %e, "Backend call failed");
        }
        result
    }

    fn validate_external(record: &KeyRecord, operation: &str) -> Result<(), SyncError> {
        if !labels::is_external(&record.label) {
            return Err(SyncError::Validation(format!(
                "{operation}: label '{}' is not an external key label",
                record.label
            )));
        }
        Ok(())
    }

    fn apply_cipher(record: &mut KeyRecord, cipher_key: String) {
        // Empty means the backend keeps the material; never retain cleartext.
        record.value = cipher_key;
    }

    pub async fn login(&self) -> Result<String, SyncError> {
        let result = self.call("login", self.backend.login()).await;
        metrics::record_login(self.name(), result.is_ok());
        result
    }

    /// Login once if no session is held.
    pub async fn ensure_session(&self) -> Result<(), SyncError> {
        if !self.backend.has_session().await {
            self.login().await?;
        }
        Ok(())
    }

    pub async fn create_key(&self, label: &str, serial: u32) -> Result<KeyRecord, SyncError> {
        labels::key_type_for_internal(label)?;
        self.call("create_key", self.backend.create_key(label, serial)).await
    }

    /// Hand external key material to the backend. On success `record.value`
    /// is replaced by the backend's handle (or cleared).
    pub async fn store_key(&self, record: &mut KeyRecord) -> Result<(), SyncError> {
        Self::validate_external(record, "store_key")?;
        let req = StoreKeyRequest::from_record(record);
        let resp = self.call("store_key", self.backend.store_key(&req)).await?;
        Self::apply_cipher(record, resp.cipher_key);
        Ok(())
    }

    /// As [`store_key`](Self::store_key), for existing keys.
    pub async fn update_key(&self, record: &mut KeyRecord) -> Result<(), SyncError> {
        Self::validate_external(record, "update_key")?;
        let req = StoreKeyRequest::from_record(record);
        let resp = self.call("update_key", self.backend.update_key(&req)).await?;
        Self::apply_cipher(record, resp.cipher_key);
        Ok(())
    }

    /// Accepts internal and external labels.
    pub async fn delete_key(&self, label: &str, serial: u32) -> Result<(), SyncError> {
        if labels::classify(label).is_none() {
            return Err(SyncError::Validation(format!("delete_key: label '{label}' is not in the allow-list")));
        }
        self.call("delete_key", self.backend.delete_key(label, serial)).await
    }

    pub async fn list_keys(&self, label: &str) -> Result<Vec<BackendKey>, SyncError> {
        if labels::classify(label).is_none() {
            return Err(SyncError::Validation(format!("list_keys: label '{label}' is not in the allow-list")));
        }
        self.call("list_keys", self.backend.list_keys(label)).await
    }

    pub async fn rotate_key(&self, label: &str) -> Result<(), SyncError> {
        self.call("rotate_key", self.backend.rotate_key(label)).await
    }

    pub async fn latest_key_version(&self, label: &str) -> Result<u64, SyncError> {
        self.call("latest_key_version", self.backend.latest_key_version(label)).await
    }

    pub async fn encrypt(&self, label: &str, plaintext: &[u8], aad: &[u8]) -> Result<String, SyncError> {
        self.call("encrypt", self.backend.encrypt(label, plaintext, aad)).await
    }

    pub async fn rewrap(&self, label: &str, ciphertext: &str, aad: &[u8]) -> Result<String, SyncError> {
        self.call("rewrap", self.backend.rewrap(label, ciphertext, aad)).await
    }

    /// Not gated by the circuit. A probe that overruns the call timeout
    /// counts as unhealthy.
    pub async fn health_probe(&self) -> ProbeStatus {
        match tokio::time::timeout(self.call_timeout, self.backend.health_probe()).await {
            Ok(status) => status,
            Err(_) => ProbeStatus::Unhealthy(format!("probe timed out after {:?}", self.call_timeout)),
        }
    }

    /// Login bypassing the circuit, for the health monitor's inline re-auth.
    pub async fn relogin(&self) -> Result<String, SyncError> {
        let result = match tokio::time::timeout(self.call_timeout, self.backend.login()).await {
            Ok(r) => r,
            Err(_) => Err(SyncError::Timeout(self.call_timeout)),
        };
        metrics::record_login(self.name(), result.is_ok());
        result
    }
}
