//! Coordinator lifecycle: connect, spawn background loops, shutdown.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backend;
use crate::config::K4SyncConfig;
use crate::error::SyncError;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::memory::{InMemoryKeyStore, InMemoryRefStore, InMemorySubscriberStore};
use crate::storage::sql::SqlKeyStore;
use crate::storage::traits::{KeyRecordStore, KeyRefStore, SubscriberStore};
use crate::storage::transactional::TransactionalKeyStore;

use super::{SyncCoordinator, SyncMessage, TriggerOutcome};

impl SyncCoordinator {
    /// Build a coordinator from configuration.
    ///
    /// Startup flow:
    /// 1. Validate configuration
    /// 2. Open stores (SQL when `sql_url` is set, in-memory otherwise)
    /// 3. Build the configured backend
    /// 4. First login, retried with the startup preset. A backend that
    ///    still refuses leaves the circuit DOWN; the health monitor brings
    ///    it back once the backend recovers.
    #[tracing::instrument(skip(config), fields(backend = %config.backend))]
    pub async fn connect(config: K4SyncConfig) -> Result<Self, SyncError> {
        // ========== PHASE 1: Validate ==========
        config.validate()?;

        // ========== PHASE 2: Stores ==========
        let (records, refs, subscribers): (
            Arc<dyn KeyRecordStore>,
            Arc<dyn KeyRefStore>,
            Arc<dyn SubscriberStore>,
        ) = match &config.sql_url {
            Some(url) => {
                info!("Connecting to SQL key store");
                let sql = Arc::new(SqlKeyStore::new(url).await.map_err(|e| {
                    error!(error = %e, "SQL key store unavailable");
                    SyncError::from(e)
                })?);
                (
                    sql.clone() as Arc<dyn KeyRecordStore>,
                    sql.clone() as Arc<dyn KeyRefStore>,
                    sql as Arc<dyn SubscriberStore>,
                )
            }
            None => {
                warn!("No SQL URL configured, key records are kept in memory only");
                (
                    Arc::new(InMemoryKeyStore::new()) as Arc<dyn KeyRecordStore>,
                    Arc::new(InMemoryRefStore::new()) as Arc<dyn KeyRefStore>,
                    Arc::new(InMemorySubscriberStore::new()) as Arc<dyn SubscriberStore>,
                )
            }
        };
        let store = Arc::new(TransactionalKeyStore::new(records, refs));

        // ========== PHASE 3: Backend ==========
        let backend = backend::from_config(&config)?;
        let coordinator = Self::new(config, backend, store, subscribers);

        // ========== PHASE 4: First login ==========
        if coordinator.gateway.is_enabled() {
            let gateway = &coordinator.gateway;
            match retry("backend_login", &RetryConfig::startup(), || gateway.relogin()).await {
                Ok(_) => info!(backend = gateway.name(), "Backend session established"),
                Err(e) => {
                    error!(backend = gateway.name(), error = %e, "Backend login failed, starting with circuit DOWN");
                    gateway.circuit().trip(format!("startup login: {e}"));
                }
            }
        }

        Ok(coordinator)
    }

    /// Start the health monitor and the dispatcher.
    pub fn spawn(self: Arc<Self>) -> CoordinatorHandle {
        let (sender, messages) = mpsc::channel(self.config.channel_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let health = tokio::spawn(self.health.clone().run(shutdown_rx.clone()));
        let dispatcher = tokio::spawn(self.clone().run_dispatcher(messages, shutdown_rx));
        info!(backend = self.gateway.name(), "Sync coordinator running");

        CoordinatorHandle {
            sender,
            shutdown,
            tasks: vec![health, dispatcher],
        }
    }
}

/// Owner's handle on a running coordinator.
pub struct CoordinatorHandle {
    sender: mpsc::Sender<SyncMessage>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// Another producer for the dispatcher queue.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<SyncMessage> {
        self.sender.clone()
    }

    /// Queue a message without waiting for its outcome.
    pub async fn send(&self, message: SyncMessage) -> Result<(), SyncError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| SyncError::Backend("sync dispatcher stopped".into()))
    }

    /// Queue a message and wait for its outcome. `None` for unknown actions.
    pub async fn request(&self, mut message: SyncMessage) -> Result<Option<TriggerOutcome>, SyncError> {
        let (tx, rx) = oneshot::channel();
        message.reply = Some(tx);
        self.send(message).await?;
        // A dropped reply sender means the action was unknown
        Ok(rx.await.ok())
    }

    /// Stop both loops and wait for them. An in-flight sweep finishes first.
    pub async fn shutdown(self) {
        info!("Sync coordinator shutting down");
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Sync coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let config = K4SyncConfig { backend: BackendKind::Hsm, ..Default::default() };
        assert!(matches!(SyncCoordinator::connect(config).await, Err(SyncError::Validation(_))));
    }

    #[tokio::test]
    async fn test_spawn_request_and_shutdown() {
        let coordinator = Arc::new(SyncCoordinator::connect(K4SyncConfig::default()).await.unwrap());
        let handle = coordinator.clone().spawn();

        let outcome = handle.request(SyncMessage::parse("SYNC_USERS")).await.unwrap();
        assert!(outcome.unwrap().is_success());
        assert!(handle.request(SyncMessage::parse("NOPE")).await.unwrap().is_none());

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_with_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("k4.db").display());
        let config = K4SyncConfig { sql_url: Some(url), ..Default::default() };

        let coordinator = SyncCoordinator::connect(config).await.unwrap();
        assert!(coordinator.store().list_all().await.unwrap().is_empty());
    }
}
