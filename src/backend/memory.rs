// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process backend with transit-style versioning and fault toggles.
//!
//! Performs no real cryptography: ciphertexts are opaque
//! `vault:v<N>:<payload>` strings whose payload merely encodes the AAD and
//! plaintext, so rewraps can check the AAD binding. Every call is counted,
//! which is what the circuit-gating tests assert on.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::{BackendKey, KeyBackend, ProbeStatus, StoreKeyRequest, StoreKeyResponse};
use crate::error::SyncError;
use crate::key_record::{KeyRecord, KeyType};
use crate::labels;

#[derive(Default)]
pub struct InMemoryBackend {
    keys: DashMap<(String, u32), KeyType>,
    versions: DashMap<String, u64>,
    calls: Mutex<HashMap<&'static str, u64>>,
    logins: AtomicU64,
    latency: Mutex<Duration>,

    session: AtomicBool,
    auth_expired: AtomicBool,
    fail_auth: AtomicBool,
    fail_health: AtomicBool,
    fail_encrypt: AtomicBool,
    fail_rewrap: AtomicBool,
    malformed_rewrap: AtomicBool,
    fail_store: AtomicBool,
    return_empty_cipher: AtomicBool,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn enter(&self, op: &'static str) {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn version_of(&self, label: &str) -> u64 {
        self.versions.get(label).map(|v| *v).unwrap_or(1)
    }

    /// Calls made to `op` so far.
    #[must_use]
    pub fn calls(&self, op: &str) -> u64 {
        self.calls.lock().get(op).copied().unwrap_or(0)
    }

    /// Calls made to any operation, probes included.
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.calls.lock().values().sum()
    }

    #[must_use]
    pub fn logins(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    /// Pretend the backend already holds a key.
    pub fn seed_key(&self, label: &str, serial: u32, key_type: KeyType) {
        self.keys.insert((label.to_string(), serial), key_type);
    }

    #[must_use]
    pub fn has_key(&self, label: &str, serial: u32) -> bool {
        self.keys.contains_key(&(label.to_string(), serial))
    }

    pub fn set_key_version(&self, label: &str, version: u64) {
        self.versions.insert(label.to_string(), version);
    }

    /// Drop the session and make the next probe report it.
    pub fn expire_session(&self) {
        self.session.store(false, Ordering::Release);
        self.auth_expired.store(true, Ordering::Release);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn set_fail_auth(&self, fail: bool) {
        self.fail_auth.store(fail, Ordering::Release);
    }

    pub fn set_fail_health(&self, fail: bool) {
        self.fail_health.store(fail, Ordering::Release);
    }

    pub fn set_fail_encrypt(&self, fail: bool) {
        self.fail_encrypt.store(fail, Ordering::Release);
    }

    pub fn set_fail_rewrap(&self, fail: bool) {
        self.fail_rewrap.store(fail, Ordering::Release);
    }

    /// Rewrap answers with a ciphertext that has no version tag.
    pub fn set_malformed_rewrap(&self, malformed: bool) {
        self.malformed_rewrap.store(malformed, Ordering::Release);
    }

    pub fn set_fail_store(&self, fail: bool) {
        self.fail_store.store(fail, Ordering::Release);
    }

    pub fn set_return_empty_cipher(&self, empty: bool) {
        self.return_empty_cipher.store(empty, Ordering::Release);
    }

    fn seal(version: u64, plaintext: &[u8], aad: &[u8]) -> String {
        let payload = format!("{}.{}", hex::encode(aad), hex::encode(plaintext));
        format!("vault:v{version}:{}", BASE64.encode(payload))
    }

    /// Recover the plaintext, checking the AAD binding.
    #[must_use]
    pub fn open(ciphertext: &str, aad: &[u8]) -> Option<Vec<u8>> {
        let payload = ciphertext.splitn(3, ':').nth(2)?;
        let decoded = String::from_utf8(BASE64.decode(payload).ok()?).ok()?;
        let (bound_aad, plaintext) = decoded.split_once('.')?;
        if bound_aad != hex::encode(aad) {
            return None;
        }
        hex::decode(plaintext).ok()
    }

    fn store(&self, req: &StoreKeyRequest) -> Result<StoreKeyResponse, SyncError> {
        if self.fail_store.load(Ordering::Acquire) {
            return Err(SyncError::Backend("store refused".into()));
        }
        let key_type: KeyType = req.key_type.parse()?;
        self.keys.insert((req.key_label.clone(), req.id), key_type);
        let cipher_key = if self.return_empty_cipher.load(Ordering::Acquire) {
            String::new()
        } else {
            format!("mem:{}:{}", req.key_label, req.id)
        };
        Ok(StoreKeyResponse { cipher_key })
    }
}

#[async_trait]
impl KeyBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn has_session(&self) -> bool {
        self.session.load(Ordering::Acquire)
    }

    async fn login(&self) -> Result<String, SyncError> {
        self.enter("login").await;
        if self.fail_auth.load(Ordering::Acquire) {
            return Err(SyncError::Auth("invalid credentials".into()));
        }
        let n = self.logins.fetch_add(1, Ordering::Relaxed) + 1;
        self.session.store(true, Ordering::Release);
        self.auth_expired.store(false, Ordering::Release);
        Ok(format!("mem-token-{n}"))
    }

    async fn create_key(&self, label: &str, serial: u32) -> Result<KeyRecord, SyncError> {
        self.enter("create_key").await;
        let key_type = labels::key_type_for_internal(label)?;
        self.keys.insert((label.to_string(), serial), key_type);
        Ok(KeyRecord::new(serial, label, key_type, ""))
    }

    async fn store_key(&self, req: &StoreKeyRequest) -> Result<StoreKeyResponse, SyncError> {
        self.enter("store_key").await;
        self.store(req)
    }

    async fn update_key(&self, req: &StoreKeyRequest) -> Result<StoreKeyResponse, SyncError> {
        self.enter("update_key").await;
        self.store(req)
    }

    async fn delete_key(&self, label: &str, serial: u32) -> Result<(), SyncError> {
        self.enter("delete_key").await;
        self.keys.remove(&(label.to_string(), serial));
        Ok(())
    }

    async fn list_keys(&self, label: &str) -> Result<Vec<BackendKey>, SyncError> {
        self.enter("list_keys").await;
        let mut keys: Vec<BackendKey> = self
            .keys
            .iter()
            .filter(|e| e.key().0 == label)
            .map(|e| BackendKey {
                label: e.key().0.clone(),
                serial: e.key().1,
                key_type: Some(*e.value()),
            })
            .collect();
        keys.sort_by_key(|k| k.serial);
        Ok(keys)
    }

    async fn health_probe(&self) -> ProbeStatus {
        self.enter("health_probe").await;
        if self.fail_health.load(Ordering::Acquire) {
            ProbeStatus::Unhealthy("backend reports sealed".into())
        } else if self.auth_expired.load(Ordering::Acquire) {
            ProbeStatus::AuthExpired
        } else {
            ProbeStatus::Healthy
        }
    }

    async fn rotate_key(&self, label: &str) -> Result<(), SyncError> {
        self.enter("rotate_key").await;
        let mut version = self.versions.entry(label.to_string()).or_insert(1);
        *version += 1;
        Ok(())
    }

    async fn latest_key_version(&self, label: &str) -> Result<u64, SyncError> {
        self.enter("latest_key_version").await;
        Ok(self.version_of(label))
    }

    async fn encrypt(&self, label: &str, plaintext: &[u8], aad: &[u8]) -> Result<String, SyncError> {
        self.enter("encrypt").await;
        if self.fail_encrypt.load(Ordering::Acquire) {
            return Err(SyncError::Backend("encrypt refused".into()));
        }
        Ok(Self::seal(self.version_of(label), plaintext, aad))
    }

    async fn rewrap(&self, label: &str, ciphertext: &str, aad: &[u8]) -> Result<String, SyncError> {
        self.enter("rewrap").await;
        if self.fail_rewrap.load(Ordering::Acquire) {
            return Err(SyncError::Backend("rewrap refused".into()));
        }
        if self.malformed_rewrap.load(Ordering::Acquire) {
            return Ok("garbage-without-version".into());
        }
        let plaintext = Self::open(ciphertext, aad)
            .ok_or_else(|| SyncError::Backend("ciphertext or context mismatch".into()))?;
        Ok(Self::seal(self.version_of(label), &plaintext, aad))
    }
}
