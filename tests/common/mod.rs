//! Shared wiring for the integration tests: an in-process backend plus
//! in-memory stores behind a coordinator.

#![allow(dead_code)]

use std::sync::Arc;

use k4_sync::backend::InMemoryBackend;
use k4_sync::storage::memory::{InMemoryKeyStore, InMemoryRefStore, InMemorySubscriberStore};
use k4_sync::{K4SyncConfig, SyncCoordinator, TransactionalKeyStore};

pub struct Harness {
    pub coordinator: Arc<SyncCoordinator>,
    pub backend: Arc<InMemoryBackend>,
    pub subscribers: Arc<InMemorySubscriberStore>,
    pub store: Arc<TransactionalKeyStore>,
}

pub fn harness() -> Harness {
    harness_with(K4SyncConfig::default())
}

pub fn harness_with(config: K4SyncConfig) -> Harness {
    let backend = Arc::new(InMemoryBackend::new());
    let subscribers = Arc::new(InMemorySubscriberStore::new());
    let store = Arc::new(TransactionalKeyStore::new(
        Arc::new(InMemoryKeyStore::new()),
        Arc::new(InMemoryRefStore::new()),
    ));
    let coordinator = Arc::new(SyncCoordinator::new(
        config,
        backend.clone(),
        store.clone(),
        subscribers.clone(),
    ));
    Harness { coordinator, backend, subscribers, store }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
