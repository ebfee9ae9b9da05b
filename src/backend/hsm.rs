// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HSM-style key-management service over HTTPS/JSON.
//!
//! Endpoints (all `POST` with a bearer token unless noted):
//!
//! | Path                 | Body                                      | Response            |
//! |----------------------|-------------------------------------------|---------------------|
//! | `/login` (no token)  | `{service_id, password}`                  | `{token}`           |
//! | `/generate-aes-key`  | `{id, bits, key_label}`                   | ignored             |
//! | `/generate-des3-key` | `{id, key_label}`                         | ignored             |
//! | `/generate-des-key`  | `{id, key_label}`                         | ignored             |
//! | `/store-key`         | `{key_label, id, key_value, key_type}`    | `{cipher_key}`      |
//! | `/update-key`        | `{key_label, id, key_value, key_type}`    | `{cipher_key}`      |
//! | `/delete-key`        | `{id, key_label}`                         | ignored             |
//! | `/get-data-keys`     | `{key_label}`                             | `{keys: [{id, ..}]}`|
//! | `GET /health-check`  |                                           | `{status}`          |
//!
//! The service generates and holds key material itself; generated keys are
//! never returned to the client.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use super::session::BackendSession;
use super::{build_http_client, BackendKey, KeyBackend, ProbeStatus, StoreKeyRequest, StoreKeyResponse};
use crate::config::HsmConfig;
use crate::error::SyncError;
use crate::key_record::{KeyRecord, KeyType};
use crate::labels;

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Deserialize)]
struct DataKeyInfo {
    id: u32,
    #[serde(default)]
    key_type: Option<String>,
}

#[derive(Deserialize)]
struct DataKeysResponse {
    #[serde(default)]
    keys: Vec<DataKeyInfo>,
}

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
}

pub struct HsmBackend {
    client: Client,
    base_url: String,
    service_id: String,
    password: String,
    session: BackendSession,
}

impl HsmBackend {
    pub fn new(config: &HsmConfig, timeout: Duration) -> Result<Self, SyncError> {
        let client = build_http_client(timeout, config.ca_bundle_path.as_deref(), config.tls_insecure)?;
        Ok(Self {
            client,
            base_url: config.uri.trim_end_matches('/').to_string(),
            service_id: config.service_id.clone(),
            password: config.password.clone(),
            session: BackendSession::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn authenticate(&self) -> Result<String, SyncError> {
        let resp = self
            .client
            .post(self.url("/login"))
            .json(&json!({"service_id": self.service_id, "password": self.password}))
            .send()
            .await
            .map_err(|e| SyncError::Auth(format!("login request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::Auth(format!("login rejected: HTTP {status}")));
        }
        let body: LoginResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Auth(format!("malformed login response: {e}")))?;
        info!(service_id = %self.service_id, "Logged in to key-management service");
        Ok(body.token)
    }

    /// One attempt. `Ok(None)` means the token was rejected.
    async fn attempt<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: String,
    ) -> Result<Option<T>, SyncError> {
        let mut req = self.client.request(method, self.url(path)).bearer_auth(token);
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req.send().await?;
        let status = resp.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Ok(None);
        }
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(SyncError::Backend(format!("{path}: HTTP {status}: {text}")));
        }
        let value: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|e| SyncError::Backend(format!("{path}: malformed response: {e}")))?
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| SyncError::Backend(format!("{path}: unexpected response: {e}")))
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, SyncError> {
        let body = &body;
        self.session
            .authorized(
                || self.authenticate(),
                move |token| self.attempt(Method::POST, path, Some(body), token),
            )
            .await
    }
}

#[async_trait]
impl KeyBackend for HsmBackend {
    fn name(&self) -> &'static str {
        "hsm"
    }

    async fn has_session(&self) -> bool {
        self.session.is_active().await
    }

    async fn login(&self) -> Result<String, SyncError> {
        let token = self.authenticate().await?;
        self.session.set(token.clone()).await;
        Ok(token)
    }

    async fn create_key(&self, label: &str, serial: u32) -> Result<KeyRecord, SyncError> {
        let key_type = labels::key_type_for_internal(label)?;
        let (path, body) = match key_type {
            KeyType::Aes128 | KeyType::Aes256 => (
                "/generate-aes-key",
                json!({"id": serial, "bits": key_type.bits(), "key_label": label}),
            ),
            KeyType::Des3 => ("/generate-des3-key", json!({"id": serial, "key_label": label})),
            KeyType::Des => ("/generate-des-key", json!({"id": serial, "key_label": label})),
        };
        info!(label, serial, key_type = %key_type, "Generating key in key-management service");
        let _: Value = self.post(path, body).await?;
        Ok(KeyRecord::new(serial, label, key_type, ""))
    }

    async fn store_key(&self, req: &StoreKeyRequest) -> Result<StoreKeyResponse, SyncError> {
        let body = serde_json::to_value(req).map_err(|e| SyncError::Backend(e.to_string()))?;
        self.post("/store-key", body).await
    }

    async fn update_key(&self, req: &StoreKeyRequest) -> Result<StoreKeyResponse, SyncError> {
        let body = serde_json::to_value(req).map_err(|e| SyncError::Backend(e.to_string()))?;
        self.post("/update-key", body).await
    }

    async fn delete_key(&self, label: &str, serial: u32) -> Result<(), SyncError> {
        let _: Value = self
            .post("/delete-key", json!({"id": serial, "key_label": label}))
            .await?;
        Ok(())
    }

    async fn list_keys(&self, label: &str) -> Result<Vec<BackendKey>, SyncError> {
        let resp: DataKeysResponse = self.post("/get-data-keys", json!({"key_label": label})).await?;
        debug!(label, count = resp.keys.len(), "Listed keys from key-management service");
        Ok(resp
            .keys
            .into_iter()
            .map(|k| BackendKey {
                label: label.to_string(),
                serial: k.id,
                key_type: k.key_type.and_then(|t| t.parse().ok()),
            })
            .collect())
    }

    async fn health_probe(&self) -> ProbeStatus {
        let mut req = self.client.get(self.url("/health-check"));
        if let Some(token) = self.session.token().await {
            req = req.bearer_auth(token);
        }
        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => return ProbeStatus::Unhealthy(e.to_string()),
        };
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return ProbeStatus::AuthExpired;
        }
        if !status.is_success() {
            return ProbeStatus::Unhealthy(format!("HTTP {status}"));
        }
        match resp.json::<HealthResponse>().await {
            Ok(h) if h.status == "OK" => ProbeStatus::Healthy,
            Ok(h) => ProbeStatus::Unhealthy(format!("status {}", h.status)),
            Err(e) => ProbeStatus::Unhealthy(format!("malformed health response: {e}")),
        }
    }
}
