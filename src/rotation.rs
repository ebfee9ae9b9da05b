// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Key rotation and ciphertext rewrap.
//!
//! Rotation creates a new backend key version; older ciphertexts stay
//! decryptable until rewrapped. [`KeyRotationEngine::maybe_rewrap`] brings
//! one subscriber's ciphertext up to the latest version, and guarantees the
//! stored version never goes backwards: a rewrap answer that cannot be
//! parsed, or parses to an older version, leaves the state untouched.

use tracing::{debug, info, warn};

use crate::backend::BackendGateway;
use crate::error::SyncError;
use crate::labels;
use crate::metrics;
use crate::subscriber::SubscriberKeyState;

/// Extract `N` from a `<scheme>:v<N>:<payload>` ciphertext.
pub fn ciphertext_version(ciphertext: &str) -> Result<u64, SyncError> {
    let malformed = || SyncError::InvalidCiphertextFormat(truncate(ciphertext));

    let mut parts = ciphertext.splitn(3, ':');
    let scheme = parts.next().ok_or_else(malformed)?;
    let tag = parts.next().ok_or_else(malformed)?;
    let payload = parts.next().ok_or_else(malformed)?;

    if scheme.is_empty() || payload.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(malformed());
    }
    let digits = tag.strip_prefix('v').ok_or_else(malformed)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    digits.parse().map_err(|_| malformed())
}

/// Enough of a ciphertext to recognise it in a log line.
fn truncate(ciphertext: &str) -> String {
    ciphertext.chars().take(24).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewrapOutcome {
    /// Already at or above the backend's latest version.
    Current { version: u64 },
    Rewrapped { from: u64, to: u64 },
}

pub struct KeyRotationEngine {
    gateway: BackendGateway,
    /// Internal key used when a subscriber carries no usable key reference.
    default_label: String,
}

impl KeyRotationEngine {
    pub fn new(gateway: BackendGateway, default_label: impl Into<String>) -> Self {
        Self {
            gateway,
            default_label: default_label.into(),
        }
    }

    #[must_use]
    pub fn default_label(&self) -> &str {
        &self.default_label
    }

    /// Rotate a backend-held key.
    #[tracing::instrument(skip(self))]
    pub async fn rotate_key(&self, label: &str) -> Result<(), SyncError> {
        if self.gateway.circuit().is_down() {
            self.gateway.circuit().record_rejection("rotate_key");
            metrics::record_rotation(label, "rejected");
            warn!("Backend down, rotation skipped");
            return Err(SyncError::BackendUnavailable);
        }

        let result = async {
            self.gateway.ensure_session().await?;
            self.gateway.rotate_key(label).await
        }
        .await;

        match &result {
            Ok(()) => {
                metrics::record_rotation(label, "success");
                info!("Key rotated");
            }
            Err(e) => {
                metrics::record_rotation(label, "error");
                warn!(error = %e, "Key rotation failed");
            }
        }
        result
    }

    /// Current backend version of `label`.
    pub async fn key_version(&self, label: &str) -> Result<u64, SyncError> {
        let version = self.gateway.latest_key_version(label).await?;
        metrics::set_key_version(label, version);
        Ok(version)
    }

    fn label_for(&self, state: &SubscriberKeyState) -> String {
        labels::split_key_reference(&state.encryption_key_reference)
            .map(|(label, _)| label)
            .filter(|label| labels::is_internal(label))
            .unwrap_or(&self.default_label)
            .to_string()
    }

    /// Rewrap `state`'s ciphertext if the backend key has moved on.
    ///
    /// Only `permanent_key_value` is ever changed; AAD, algorithm and key
    /// reference stay as they were. On any error `state` is untouched.
    pub async fn maybe_rewrap(
        &self,
        subscriber_id: &str,
        state: &mut SubscriberKeyState,
    ) -> Result<RewrapOutcome, SyncError> {
        let current = ciphertext_version(&state.permanent_key_value)?;
        let label = self.label_for(state);

        let latest = self.gateway.latest_key_version(&label).await?;
        if current >= latest {
            metrics::record_rewrap("current");
            debug!(ue_id = subscriber_id, version = current, "Ciphertext is current");
            return Ok(RewrapOutcome::Current { version: current });
        }

        let aad = state.aad_bytes(subscriber_id);
        let rewrapped = match self.gateway.rewrap(&label, &state.permanent_key_value, &aad).await {
            Ok(ct) => ct,
            Err(e) => {
                metrics::record_rewrap("error");
                return Err(e);
            }
        };

        let new_version = match ciphertext_version(&rewrapped) {
            Ok(v) if v >= current => v,
            Ok(v) => {
                metrics::record_rewrap("regressed");
                warn!(ue_id = subscriber_id, from = current, to = v, "Rewrap returned an older version, keeping ciphertext");
                return Err(SyncError::Backend(format!("rewrap regressed version {current} -> {v}")));
            }
            Err(e) => {
                metrics::record_rewrap("malformed");
                warn!(ue_id = subscriber_id, error = %e, "Malformed rewrap response, keeping ciphertext");
                return Err(e);
            }
        };

        state.permanent_key_value = rewrapped;
        metrics::record_rewrap("rewrapped");
        info!(ue_id = subscriber_id, from = current, to = new_version, "Ciphertext rewrapped");
        Ok(RewrapOutcome::Rewrapped { from: current, to: new_version })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::resilience::circuit::CircuitState;
    use crate::subscriber::{derive_aad, ALGORITHM_AES256_INTERNAL};
    use std::sync::Arc;
    use std::time::Duration;

    const LABEL: &str = labels::K4_ENC_AES256;

    fn engine() -> (KeyRotationEngine, Arc<InMemoryBackend>, Arc<CircuitState>) {
        let backend = Arc::new(InMemoryBackend::new());
        let circuit = Arc::new(CircuitState::new());
        let gw = BackendGateway::new(backend.clone(), circuit.clone(), Duration::from_secs(1));
        (KeyRotationEngine::new(gw, LABEL), backend, circuit)
    }

    async fn encrypted_state(backend: &InMemoryBackend, ue: &str) -> SubscriberKeyState {
        let aad = derive_aad(ue, 0, 0);
        let ct = backend.encrypt(LABEL, b"abc123", &aad).await.unwrap();
        SubscriberKeyState {
            permanent_key_value: ct,
            encryption_algorithm: ALGORITHM_AES256_INTERNAL,
            key_serial_reference: 1,
            aad: hex::encode(&aad),
            encryption_key_reference: labels::key_reference(LABEL, 1),
        }
    }

    use crate::backend::KeyBackend;

    #[test]
    fn test_ciphertext_version() {
        assert_eq!(ciphertext_version("vault:v1:XYZ").unwrap(), 1);
        assert_eq!(ciphertext_version("vault:v42:a:b:c").unwrap(), 42);
        for bad in ["", "vault", "vault:v1", "vault:1:XYZ", "vault:v:XYZ", "vault:vx:XYZ", ":v1:XYZ", "vault:v1:", "vault:v-1:X"] {
            assert!(
                matches!(ciphertext_version(bad), Err(SyncError::InvalidCiphertextFormat(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_rotate_requires_healthy_circuit() {
        let (engine, backend, circuit) = engine();
        circuit.trip("down");
        assert!(matches!(engine.rotate_key(LABEL).await, Err(SyncError::BackendUnavailable)));
        assert_eq!(backend.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_rotate_logs_in_when_no_session() {
        let (engine, backend, _) = engine();
        engine.rotate_key(LABEL).await.unwrap();
        assert_eq!(backend.logins(), 1);
        assert_eq!(backend.latest_key_version(LABEL).await.unwrap(), 2);

        // Session now held: no second login
        engine.rotate_key(LABEL).await.unwrap();
        assert_eq!(backend.logins(), 1);
    }

    #[tokio::test]
    async fn test_rotate_login_failure_trips_circuit() {
        let (engine, backend, circuit) = engine();
        backend.set_fail_auth(true);
        assert!(matches!(engine.rotate_key(LABEL).await, Err(SyncError::Auth(_))));
        assert!(circuit.is_down());
        assert_eq!(backend.calls("rotate_key"), 0);
    }

    #[tokio::test]
    async fn test_rewrap_after_rotation_then_idempotent() {
        let (engine, backend, _) = engine();
        let mut state = encrypted_state(&backend, "u1").await;
        let before = state.clone();

        backend.set_key_version(LABEL, 3);
        let outcome = engine.maybe_rewrap("u1", &mut state).await.unwrap();
        assert_eq!(outcome, RewrapOutcome::Rewrapped { from: 1, to: 3 });
        assert_eq!(ciphertext_version(&state.permanent_key_value).unwrap(), 3);
        assert_eq!(state.aad, before.aad);
        assert_eq!(state.encryption_algorithm, before.encryption_algorithm);

        let snapshot = state.permanent_key_value.clone();
        let again = engine.maybe_rewrap("u1", &mut state).await.unwrap();
        assert_eq!(again, RewrapOutcome::Current { version: 3 });
        assert_eq!(state.permanent_key_value, snapshot);
    }

    #[tokio::test]
    async fn test_malformed_ciphertext_makes_no_call() {
        let (engine, backend, _) = engine();
        let mut state = SubscriberKeyState {
            permanent_key_value: "not-a-ciphertext".into(),
            encryption_algorithm: ALGORITHM_AES256_INTERNAL,
            key_serial_reference: 1,
            ..Default::default()
        };
        assert!(matches!(
            engine.maybe_rewrap("u1", &mut state).await,
            Err(SyncError::InvalidCiphertextFormat(_))
        ));
        assert_eq!(backend.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_rewrap_failure_leaves_state() {
        let (engine, backend, _) = engine();
        let mut state = encrypted_state(&backend, "u1").await;
        let before = state.clone();
        backend.set_key_version(LABEL, 2);

        backend.set_fail_rewrap(true);
        assert!(engine.maybe_rewrap("u1", &mut state).await.is_err());
        assert_eq!(state, before);

        backend.set_fail_rewrap(false);
        backend.set_malformed_rewrap(true);
        assert!(engine.maybe_rewrap("u1", &mut state).await.is_err());
        assert_eq!(state, before);
    }

    #[tokio::test]
    async fn test_rewrap_uses_rebuilt_aad_when_stored_is_invalid() {
        let (engine, backend, _) = engine();
        // Encrypted with the AAD the state will fall back to: "u1-1-3"
        let aad = derive_aad("u1", 1, ALGORITHM_AES256_INTERNAL);
        let ct = backend.encrypt(LABEL, b"abc123", &aad).await.unwrap();
        let mut state = SubscriberKeyState {
            permanent_key_value: ct,
            encryption_algorithm: ALGORITHM_AES256_INTERNAL,
            key_serial_reference: 1,
            aad: String::new(),
            encryption_key_reference: String::new(),
        };
        backend.set_key_version(LABEL, 2);
        let outcome = engine.maybe_rewrap("u1", &mut state).await.unwrap();
        assert_eq!(outcome, RewrapOutcome::Rewrapped { from: 1, to: 2 });
    }
}
