// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Secret-store backend with transit-style envelope encryption.
//!
//! Internal AES labels map to transit keys named after the label (one key per
//! label, versioned by the secret store; its serial is always 1). External
//! keys live in a KV v2 mount under `<kv_prefix>/<label>-<serial>`.
//! DES/DES3 internal labels have no transit key type and are not supported.
//!
//! Ciphertexts are `vault:v<N>:<payload>`; `context` fields carry base64 AAD.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use super::session::BackendSession;
use super::{
    build_http_client, BackendKey, CiphertextResponse, KeyBackend, ProbeStatus, RewrapRequest,
    StoreKeyRequest, StoreKeyResponse,
};
use crate::config::TransitConfig;
use crate::error::SyncError;
use crate::key_record::{KeyRecord, KeyType};
use crate::labels;

/// Serial under which a transit key is referenced locally.
pub const TRANSIT_KEY_SERIAL: u32 = 1;

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct AuthEnvelope {
    auth: AuthInfo,
}

#[derive(Deserialize)]
struct AuthInfo {
    client_token: String,
}

#[derive(Deserialize)]
struct KeyInfo {
    latest_version: u64,
}

#[derive(Deserialize)]
struct KeyList {
    #[serde(default)]
    keys: Vec<String>,
}

enum Credentials {
    Token(String),
    AppRole { role_id: String, secret_id: String },
}

pub struct TransitBackend {
    client: Client,
    addr: String,
    namespace: Option<String>,
    transit_mount: String,
    kv_mount: String,
    kv_prefix: String,
    credentials: Credentials,
    session: BackendSession,
}

fn transit_key_type(label: &str) -> Option<&'static str> {
    match labels::key_type_for_internal(label).ok()? {
        KeyType::Aes128 => Some("aes128-gcm96"),
        KeyType::Aes256 => Some("aes256-gcm96"),
        KeyType::Des | KeyType::Des3 => None,
    }
}

impl TransitBackend {
    pub fn new(config: &TransitConfig, timeout: Duration) -> Result<Self, SyncError> {
        let credentials = match (&config.token, &config.role_id, &config.secret_id) {
            (Some(token), _, _) => Credentials::Token(token.clone()),
            (None, Some(role_id), Some(secret_id)) => Credentials::AppRole {
                role_id: role_id.clone(),
                secret_id: secret_id.clone(),
            },
            _ => {
                return Err(SyncError::Validation(
                    "transit backend needs a token or role_id + secret_id".into(),
                ))
            }
        };

        let client = build_http_client(timeout, config.ca_bundle_path.as_deref(), config.tls_insecure)?;
        Ok(Self {
            client,
            addr: config.addr.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            transit_mount: config.transit_mount.trim_matches('/').to_string(),
            kv_mount: config.kv_mount.trim_matches('/').to_string(),
            kv_prefix: config.kv_prefix.trim_matches('/').to_string(),
            credentials,
            session: BackendSession::new(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self.client.request(method, format!("{}/v1/{}", self.addr, path));
        if let Some(ns) = &self.namespace {
            req = req.header("X-Vault-Namespace", ns);
        }
        req
    }

    fn transit_path(&self, rest: &str) -> String {
        format!("{}/{}", self.transit_mount, rest)
    }

    fn kv_name(&self, label: &str, serial: u32) -> String {
        format!("{}/{}", self.kv_prefix, labels::key_reference(label, serial))
    }

    async fn authenticate(&self) -> Result<String, SyncError> {
        match &self.credentials {
            Credentials::Token(token) => Ok(token.clone()),
            Credentials::AppRole { role_id, secret_id } => {
                let resp = self
                    .request(Method::POST, "auth/approle/login")
                    .json(&json!({"role_id": role_id, "secret_id": secret_id}))
                    .send()
                    .await
                    .map_err(|e| SyncError::Auth(format!("login request failed: {e}")))?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(SyncError::Auth(format!("approle login rejected: HTTP {status}")));
                }
                let body: AuthEnvelope = resp
                    .json()
                    .await
                    .map_err(|e| SyncError::Auth(format!("malformed login response: {e}")))?;
                info!("Logged in to secret store via AppRole");
                Ok(body.auth.client_token)
            }
        }
    }

    /// One attempt. `Ok(None)` means the token was rejected; a 404 is
    /// returned as JSON `null` so callers can treat it as absence.
    async fn attempt<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: String,
    ) -> Result<Option<T>, SyncError> {
        let mut req = self.request(method, path).header("X-Vault-Token", token);
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req.send().await?;
        let status = resp.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Ok(None);
        }
        let text = resp.text().await?;
        let value: Value = if status == StatusCode::NOT_FOUND {
            Value::Null
        } else if !status.is_success() {
            return Err(SyncError::Backend(format!("{path}: HTTP {status}: {text}")));
        } else if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|e| SyncError::Backend(format!("{path}: malformed response: {e}")))?
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| SyncError::Backend(format!("{path}: unexpected response: {e}")))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, SyncError> {
        let body = body.as_ref();
        self.session
            .authorized(
                || self.authenticate(),
                move |token| self.attempt(method.clone(), path, body, token),
            )
            .await
    }

    async fn read_key_info(&self, label: &str) -> Result<Option<KeyInfo>, SyncError> {
        let path = self.transit_path(&format!("keys/{label}"));
        let env: Option<Envelope<KeyInfo>> = self.call(Method::GET, &path, None).await?;
        Ok(env.map(|e| e.data))
    }
}

#[async_trait]
impl KeyBackend for TransitBackend {
    fn name(&self) -> &'static str {
        "transit"
    }

    fn supports_label(&self, label: &str) -> bool {
        labels::is_external(label) || transit_key_type(label).is_some()
    }

    async fn has_session(&self) -> bool {
        self.session.is_active().await
    }

    async fn login(&self) -> Result<String, SyncError> {
        let token = self.authenticate().await?;
        self.session.set(token.clone()).await;
        Ok(token)
    }

    /// Idempotent: creating an existing transit key leaves it untouched.
    async fn create_key(&self, label: &str, serial: u32) -> Result<KeyRecord, SyncError> {
        let key_type = labels::key_type_for_internal(label)?;
        let transit_type = transit_key_type(label).ok_or_else(|| SyncError::UnsupportedLabel(label.to_string()))?;

        let path = self.transit_path(&format!("keys/{label}"));
        let _: Option<Value> = self
            .call(Method::POST, &path, Some(json!({"type": transit_type})))
            .await?;
        info!(label, transit_type, "Transit key ensured");
        Ok(KeyRecord::new(serial, label, key_type, ""))
    }

    async fn store_key(&self, req: &StoreKeyRequest) -> Result<StoreKeyResponse, SyncError> {
        let path = format!("{}/data/{}", self.kv_mount, self.kv_name(&req.key_label, req.id));
        let body = json!({"data": {"key_value": req.key_value, "key_type": req.key_type}});
        let _: Option<Value> = self.call(Method::POST, &path, Some(body)).await?;
        // The secret store keeps the material; nothing client-visible comes back.
        Ok(StoreKeyResponse::default())
    }

    async fn update_key(&self, req: &StoreKeyRequest) -> Result<StoreKeyResponse, SyncError> {
        self.store_key(req).await
    }

    async fn delete_key(&self, label: &str, serial: u32) -> Result<(), SyncError> {
        if labels::is_internal(label) {
            let config_path = self.transit_path(&format!("keys/{label}/config"));
            let _: Option<Value> = self
                .call(Method::POST, &config_path, Some(json!({"deletion_allowed": true})))
                .await?;
            let path = self.transit_path(&format!("keys/{label}"));
            let _: Option<Value> = self.call(Method::DELETE, &path, None).await?;
        } else {
            let path = format!("{}/metadata/{}", self.kv_mount, self.kv_name(label, serial));
            let _: Option<Value> = self.call(Method::DELETE, &path, None).await?;
        }
        Ok(())
    }

    async fn list_keys(&self, label: &str) -> Result<Vec<BackendKey>, SyncError> {
        if labels::is_internal(label) {
            let info = self.read_key_info(label).await?;
            return Ok(info
                .map(|_| BackendKey {
                    label: label.to_string(),
                    serial: TRANSIT_KEY_SERIAL,
                    key_type: labels::key_type_for_internal(label).ok(),
                })
                .into_iter()
                .collect());
        }

        let path = format!("{}/metadata/{}?list=true", self.kv_mount, self.kv_prefix);
        let env: Option<Envelope<KeyList>> = self.call(Method::GET, &path, None).await?;
        let names = env.map(|e| e.data.keys).unwrap_or_default();

        let mut keys: Vec<BackendKey> = names
            .iter()
            .filter_map(|name| labels::split_key_reference(name))
            .filter(|(l, _)| *l == label)
            .map(|(l, serial)| BackendKey {
                label: l.to_string(),
                serial,
                key_type: None,
            })
            .collect();
        keys.sort_by_key(|k| k.serial);
        debug!(label, count = keys.len(), "Listed external keys from secret store");
        Ok(keys)
    }

    async fn health_probe(&self) -> ProbeStatus {
        let resp = match self.request(Method::GET, "sys/health").send().await {
            Ok(r) => r,
            Err(e) => return ProbeStatus::Unhealthy(e.to_string()),
        };
        // 429 = unsealed standby, 473 = performance standby
        match resp.status().as_u16() {
            200 | 429 | 473 => {}
            503 => return ProbeStatus::Unhealthy("sealed".into()),
            501 => return ProbeStatus::Unhealthy("not initialized".into()),
            other => return ProbeStatus::Unhealthy(format!("HTTP {other}")),
        }

        let Some(token) = self.session.token().await else {
            return ProbeStatus::AuthExpired;
        };
        match self
            .request(Method::GET, "auth/token/lookup-self")
            .header("X-Vault-Token", token)
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => ProbeStatus::Healthy,
            Ok(r) if r.status() == StatusCode::FORBIDDEN || r.status() == StatusCode::UNAUTHORIZED => {
                ProbeStatus::AuthExpired
            }
            Ok(r) => ProbeStatus::Unhealthy(format!("token lookup HTTP {}", r.status())),
            Err(e) => ProbeStatus::Unhealthy(e.to_string()),
        }
    }

    async fn rotate_key(&self, label: &str) -> Result<(), SyncError> {
        let path = self.transit_path(&format!("keys/{label}/rotate"));
        let _: Option<Value> = self.call(Method::POST, &path, None).await?;
        info!(label, "Transit key rotated");
        Ok(())
    }

    async fn latest_key_version(&self, label: &str) -> Result<u64, SyncError> {
        self.read_key_info(label)
            .await?
            .map(|k| k.latest_version)
            .ok_or_else(|| SyncError::NotFound(format!("transit key {label}")))
    }

    async fn encrypt(&self, label: &str, plaintext: &[u8], aad: &[u8]) -> Result<String, SyncError> {
        let path = self.transit_path(&format!("encrypt/{label}"));
        let body = json!({"plaintext": BASE64.encode(plaintext), "context": BASE64.encode(aad)});
        let env: Option<Envelope<CiphertextResponse>> = self.call(Method::POST, &path, Some(body)).await?;
        env.map(|e| e.data.ciphertext)
            .ok_or_else(|| SyncError::NotFound(format!("transit key {label}")))
    }

    async fn rewrap(&self, label: &str, ciphertext: &str, aad: &[u8]) -> Result<String, SyncError> {
        let path = self.transit_path(&format!("rewrap/{label}"));
        let req = RewrapRequest {
            ciphertext: ciphertext.to_string(),
            context: BASE64.encode(aad),
        };
        let body = serde_json::to_value(&req).map_err(|e| SyncError::Backend(e.to_string()))?;
        let env: Option<Envelope<CiphertextResponse>> = self.call(Method::POST, &path, Some(body)).await?;
        env.map(|e| e.data.ciphertext)
            .ok_or_else(|| SyncError::NotFound(format!("transit key {label}")))
    }
}
