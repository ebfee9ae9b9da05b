// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pluggable key backends.
//!
//! A [`KeyBackend`] is the raw capability set of one external service. The
//! engines never call it directly: they go through a [`BackendGateway`],
//! which adds the cross-cutting contract every backend call must honour
//! (label validation, circuit gating, call timeout, in-place value overwrite).
//!
//! ```text
//!   engines ──► BackendGateway ──► dyn KeyBackend
//!                  │                  ├─ HsmBackend       (key-management service)
//!                  │                  ├─ TransitBackend   (secret store, envelope encryption)
//!                  │                  ├─ DisabledBackend  (sync off, cleartext values)
//!                  ▼                  └─ InMemoryBackend  (in-process, no real crypto)
//!             CircuitState
//! ```
//!
//! Transit-only primitives (rotation, versioning, encrypt, rewrap) have
//! default implementations returning [`SyncError::Unsupported`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackendKind, K4SyncConfig};
use crate::error::SyncError;
use crate::key_record::{KeyRecord, KeyType};
use crate::labels;
use crate::resilience::circuit::CircuitState;

pub mod disabled;
pub mod gateway;
pub mod hsm;
pub mod memory;
pub mod session;
pub mod transit;

pub use disabled::DisabledBackend;
pub use gateway::BackendGateway;
pub use hsm::HsmBackend;
pub use memory::InMemoryBackend;
pub use session::BackendSession;
pub use transit::TransitBackend;

/// Store/update request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreKeyRequest {
    pub key_label: String,
    pub id: u32,
    pub key_value: String,
    pub key_type: String,
}

impl StoreKeyRequest {
    #[must_use]
    pub fn from_record(record: &KeyRecord) -> Self {
        Self {
            key_label: record.label.clone(),
            id: record.serial,
            key_value: record.value.clone(),
            key_type: record.key_type.as_str().to_string(),
        }
    }
}

/// Store/update response. An empty `cipher_key` means the backend keeps the
/// material itself and returns nothing client-visible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreKeyResponse {
    #[serde(default)]
    pub cipher_key: String,
}

/// Rewrap request body. `context` is base64 of the AAD bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewrapRequest {
    pub ciphertext: String,
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiphertextResponse {
    pub ciphertext: String,
}

/// A key as listed by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendKey {
    pub label: String,
    pub serial: u32,
    pub key_type: Option<KeyType>,
}

/// Result of a liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    Healthy,
    Unhealthy(String),
    /// The session token was rejected; a fresh login may fix it.
    AuthExpired,
}

#[async_trait]
pub trait KeyBackend: Send + Sync {
    /// Short name for logs and metric labels.
    fn name(&self) -> &'static str;

    /// False for the disabled backend: values stay local and cleartext.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Labels this backend can hold. Defaults to the whole allow-list.
    fn supports_label(&self, label: &str) -> bool {
        labels::classify(label).is_some()
    }

    /// Whether a session token is currently held.
    async fn has_session(&self) -> bool {
        true
    }

    /// Authenticate, replacing any held session. Returns the new token.
    async fn login(&self) -> Result<String, SyncError>;

    /// Generate key material of the type implied by an internal `label`.
    async fn create_key(&self, label: &str, serial: u32) -> Result<KeyRecord, SyncError>;

    async fn store_key(&self, req: &StoreKeyRequest) -> Result<StoreKeyResponse, SyncError>;

    async fn update_key(&self, req: &StoreKeyRequest) -> Result<StoreKeyResponse, SyncError>;

    async fn delete_key(&self, label: &str, serial: u32) -> Result<(), SyncError>;

    async fn list_keys(&self, label: &str) -> Result<Vec<BackendKey>, SyncError>;

    /// Lightweight liveness check. Never mutates key state.
    async fn health_probe(&self) -> ProbeStatus;

    async fn rotate_key(&self, _label: &str) -> Result<(), SyncError> {
        Err(SyncError::Unsupported { backend: self.name(), operation: "rotate_key" })
    }

    async fn latest_key_version(&self, _label: &str) -> Result<u64, SyncError> {
        Err(SyncError::Unsupported { backend: self.name(), operation: "latest_key_version" })
    }

    /// Envelope-encrypt `plaintext` under `label`, binding `aad`.
    async fn encrypt(&self, _label: &str, _plaintext: &[u8], _aad: &[u8]) -> Result<String, SyncError> {
        Err(SyncError::Unsupported { backend: self.name(), operation: "encrypt" })
    }

    /// Re-encrypt `ciphertext` under the latest version of `label`.
    async fn rewrap(&self, _label: &str, _ciphertext: &str, _aad: &[u8]) -> Result<String, SyncError> {
        Err(SyncError::Unsupported { backend: self.name(), operation: "rewrap" })
    }
}

/// Build the configured backend.
pub fn from_config(config: &K4SyncConfig) -> Result<Arc<dyn KeyBackend>, SyncError> {
    let timeout = config.call_timeout();
    match config.backend {
        BackendKind::Disabled => Ok(Arc::new(DisabledBackend::new())),
        BackendKind::Hsm => {
            let hsm = config
                .hsm
                .as_ref()
                .ok_or_else(|| SyncError::Validation("backend 'hsm' requires an hsm section".into()))?;
            Ok(Arc::new(HsmBackend::new(hsm, timeout)?))
        }
        BackendKind::Transit => {
            let transit = config
                .transit
                .as_ref()
                .ok_or_else(|| SyncError::Validation("backend 'transit' requires a transit section".into()))?;
            Ok(Arc::new(TransitBackend::new(transit, timeout)?))
        }
    }
}

/// Shared reqwest client construction for the HTTP backends.
pub(crate) fn build_http_client(
    timeout: Duration,
    ca_bundle_path: Option<&str>,
    tls_insecure: bool,
) -> Result<reqwest::Client, SyncError> {
    let mut builder = reqwest::Client::builder().timeout(timeout);

    if let Some(path) = ca_bundle_path {
        let pem = std::fs::read(path)
            .map_err(|e| SyncError::Validation(format!("failed to read CA bundle {path}: {e}")))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| SyncError::Validation(format!("invalid CA bundle {path}: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }

    if tls_insecure {
        tracing::warn!("TLS certificate verification disabled for key backend");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| SyncError::Backend(format!("failed to build HTTP client: {e}")))
}
