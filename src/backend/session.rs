// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend session token, owned by one backend and never handed out.

use std::future::Future;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::SyncError;

#[derive(Default)]
pub struct BackendSession {
    token: RwLock<Option<String>>,
}

impl BackendSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    pub(crate) async fn set(&self, token: String) {
        *self.token.write().await = Some(token);
    }

    pub async fn invalidate(&self) {
        *self.token.write().await = None;
    }

    pub async fn is_active(&self) -> bool {
        self.token.read().await.is_some()
    }

    /// Run an authenticated request.
    ///
    /// Logs in first if no token is held. `request` returns `Ok(None)` when
    /// the backend rejected the token; the session is then dropped, one
    /// fresh login is made and the request is retried once.
    pub(crate) async fn authorized<T, L, LFut, R, RFut>(
        &self,
        mut login: L,
        mut request: R,
    ) -> Result<T, SyncError>
    where
        L: FnMut() -> LFut,
        LFut: Future<Output = Result<String, SyncError>>,
        R: FnMut(String) -> RFut,
        RFut: Future<Output = Result<Option<T>, SyncError>>,
    {
        let token = match self.token().await {
            Some(t) => t,
            None => {
                let t = login().await?;
                self.set(t.clone()).await;
                t
            }
        };

        if let Some(value) = request(token).await? {
            return Ok(value);
        }

        debug!("Session token rejected, logging in again");
        self.invalidate().await;
        let token = login().await?;
        self.set(token.clone()).await;

        request(token)
            .await?
            .ok_or_else(|| SyncError::Auth("token rejected after fresh login".into()))
    }
}
