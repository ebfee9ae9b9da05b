//! Chaos testing for the key store and sweeps.
//!
//! Failing store wrappers inject errors at precise call counts so every
//! compensation path of the two-phase writes can be driven:
//! 1. **Clean rollback** - the second phase fails, compensation succeeds
//! 2. **Divergence** - the second phase fails and so does compensation
//! 3. **Partial sweeps** - one subscriber's write fails mid-sweep
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use k4_sync::backend::InMemoryBackend;
use k4_sync::storage::memory::{InMemoryKeyStore, InMemoryRefStore, InMemorySubscriberStore};
use k4_sync::{
    labels, BackendGateway, CircuitState, ErrorKind, K4SyncConfig, KeyManager, KeyRecord, KeyRecordStore,
    KeyRefStore, KeySyncEngine, KeyType, RecordKey, StorageError, SubscriberKeyState, SubscriberStore, SyncCoordinator, SyncError,
    TransactionalKeyStore, TriggerOutcome,
};

// =============================================================================
// Failing Store Wrappers - Precise Error Injection
// =============================================================================

/// Counts calls (1-indexed) and fails the listed ones.
struct Faults {
    calls: AtomicU64,
    fail_on_calls: Vec<u64>,
    error_msg: String,
}

impl Faults {
    fn new(fail_on_calls: Vec<u64>, error_msg: &str) -> Self {
        Self {
            calls: AtomicU64::new(0),
            fail_on_calls,
            error_msg: error_msg.to_string(),
        }
    }

    fn maybe_fail(&self) -> Result<(), StorageError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_calls.contains(&n) {
            Err(StorageError::Backend(self.error_msg.clone()))
        } else {
            Ok(())
        }
    }
}

struct FailingKeyStore {
    inner: Arc<InMemoryKeyStore>,
    faults: Faults,
    /// Read faults, counted per listing of `list_label` only.
    list_label: String,
    list_faults: Faults,
}

impl FailingKeyStore {
    fn new(inner: Arc<InMemoryKeyStore>, fail_on_calls: Vec<u64>) -> Self {
        Self {
            inner,
            faults: Faults::new(fail_on_calls, "primary collection offline"),
            list_label: String::new(),
            list_faults: Faults::new(vec![], "primary collection unreadable"),
        }
    }

    fn failing_lists(mut self, label: &str, fail_on_calls: Vec<u64>) -> Self {
        self.list_label = label.to_string();
        self.list_faults = Faults::new(fail_on_calls, "primary collection unreadable");
        self
    }
}

#[async_trait]
impl KeyRecordStore for FailingKeyStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<KeyRecord>, StorageError> {
        self.inner.get(key).await
    }

    async fn list_by_label(&self, label: &str) -> Result<Vec<KeyRecord>, StorageError> {
        if label == self.list_label {
            self.list_faults.maybe_fail()?;
        }
        self.inner.list_by_label(label).await
    }

    async fn list_all(&self) -> Result<Vec<KeyRecord>, StorageError> {
        self.inner.list_all().await
    }

    async fn insert(&self, record: &KeyRecord) -> Result<(), StorageError> {
        self.faults.maybe_fail()?;
        self.inner.insert(record).await
    }

    async fn put(&self, record: &KeyRecord) -> Result<(), StorageError> {
        self.faults.maybe_fail()?;
        self.inner.put(record).await
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), StorageError> {
        self.faults.maybe_fail()?;
        self.inner.delete(key).await
    }
}

struct FailingRefStore {
    inner: Arc<InMemoryRefStore>,
    faults: Faults,
}

impl FailingRefStore {
    fn new(inner: Arc<InMemoryRefStore>, fail_on_calls: Vec<u64>) -> Self {
        Self { inner, faults: Faults::new(fail_on_calls, "reference collection offline") }
    }
}

#[async_trait]
impl KeyRefStore for FailingRefStore {
    async fn insert_ref(&self, key: &RecordKey) -> Result<(), StorageError> {
        self.faults.maybe_fail()?;
        self.inner.insert_ref(key).await
    }

    async fn put_ref(&self, key: &RecordKey) -> Result<(), StorageError> {
        self.faults.maybe_fail()?;
        self.inner.put_ref(key).await
    }

    async fn delete_ref(&self, key: &RecordKey) -> Result<(), StorageError> {
        self.faults.maybe_fail()?;
        self.inner.delete_ref(key).await
    }

    async fn has_ref(&self, key: &RecordKey) -> Result<bool, StorageError> {
        self.inner.has_ref(key).await
    }

    async fn list_refs(&self) -> Result<Vec<RecordKey>, StorageError> {
        self.inner.list_refs().await
    }
}

/// Rejects writes for the listed subscribers.
struct FailingSubscriberStore {
    inner: Arc<InMemorySubscriberStore>,
    reject: HashSet<String>,
}

#[async_trait]
impl SubscriberStore for FailingSubscriberStore {
    async fn list_subscribers(&self) -> Result<Vec<String>, StorageError> {
        self.inner.list_subscribers().await
    }

    async fn get_key_state(&self, ue_id: &str) -> Result<Option<SubscriberKeyState>, StorageError> {
        self.inner.get_key_state(ue_id).await
    }

    async fn update_key_state(&self, ue_id: &str, state: &SubscriberKeyState) -> Result<(), StorageError> {
        if self.reject.contains(ue_id) {
            return Err(StorageError::Backend(format!("write to {ue_id} refused")));
        }
        self.inner.update_key_state(ue_id, state).await
    }
}

struct Stores {
    store: Arc<TransactionalKeyStore>,
    records: Arc<InMemoryKeyStore>,
    refs: Arc<InMemoryRefStore>,
}

fn stores(record_faults: Vec<u64>, ref_faults: Vec<u64>) -> Stores {
    let records = Arc::new(InMemoryKeyStore::new());
    let refs = Arc::new(InMemoryRefStore::new());
    let store = Arc::new(TransactionalKeyStore::new(
        Arc::new(FailingKeyStore::new(records.clone(), record_faults)),
        Arc::new(FailingRefStore::new(refs.clone(), ref_faults)),
    ));
    Stores { store, records, refs }
}

fn record(serial: u32, value: &str) -> KeyRecord {
    KeyRecord::new(serial, labels::K4_AES, KeyType::Aes128, value)
}

// =============================================================================
// Two-phase writes
// =============================================================================

#[tokio::test]
async fn test_create_rolls_back_when_reference_insert_fails() {
    let s = stores(vec![], vec![1]);

    let err = s.store.create(&record(1, "aa")).await.unwrap_err();
    assert!(matches!(err, SyncError::RolledBack { operation: "create", .. }));
    assert_eq!(err.kind(), ErrorKind::Transient);

    assert!(s.records.is_empty());
    assert!(s.refs.is_empty());
    assert!(s.store.find_orphans().await.unwrap().is_clean());
}

#[tokio::test]
async fn test_create_diverges_when_compensation_fails() {
    // insert (1) succeeds, compensating delete (2) fails
    let s = stores(vec![2], vec![1]);

    let err = s.store.create(&record(1, "aa")).await.unwrap_err();
    assert!(matches!(err, SyncError::Consistency { operation: "create", .. }));
    assert_eq!(err.kind(), ErrorKind::Consistency);

    let orphans = s.store.find_orphans().await.unwrap();
    assert_eq!(orphans.records_without_ref, vec![RecordKey::new(1, labels::K4_AES)]);
    assert!(orphans.refs_without_record.is_empty());
}

#[tokio::test]
async fn test_update_restores_backup_when_reference_write_fails() {
    let s = stores(vec![], vec![2]);
    s.store.create(&record(1, "aa")).await.unwrap();

    let err = s.store.update(&record(1, "bb")).await.unwrap_err();
    assert!(matches!(err, SyncError::RolledBack { operation: "update", .. }));

    let current = s.store.get(&RecordKey::new(1, labels::K4_AES)).await.unwrap().unwrap();
    assert_eq!(current.value, "aa");
    assert!(s.store.find_orphans().await.unwrap().is_clean());
}

#[tokio::test]
async fn test_update_diverges_when_restore_fails() {
    // create insert (1), update put (2), restoring put (3) fails
    let s = stores(vec![3], vec![2]);
    s.store.create(&record(1, "aa")).await.unwrap();

    let err = s.store.update(&record(1, "bb")).await.unwrap_err();
    assert!(matches!(err, SyncError::Consistency { operation: "update", .. }));

    // The new value stuck without its reference write
    let current = s.store.get(&RecordKey::new(1, labels::K4_AES)).await.unwrap().unwrap();
    assert_eq!(current.value, "bb");
}

#[tokio::test]
async fn test_delete_reinserts_when_reference_delete_fails() {
    let s = stores(vec![], vec![2]);
    s.store.create(&record(1, "aa")).await.unwrap();

    let err = s.store.delete(&RecordKey::new(1, labels::K4_AES)).await.unwrap_err();
    assert!(matches!(err, SyncError::RolledBack { operation: "delete", .. }));

    let restored = s.store.get(&RecordKey::new(1, labels::K4_AES)).await.unwrap().unwrap();
    assert_eq!(restored, record(1, "aa"));
    assert!(s.store.find_orphans().await.unwrap().is_clean());
}

#[tokio::test]
async fn test_delete_diverges_when_reinsert_fails() {
    // create insert (1), delete (2), re-insert put (3) fails
    let s = stores(vec![3], vec![2]);
    s.store.create(&record(1, "aa")).await.unwrap();

    let err = s.store.delete(&RecordKey::new(1, labels::K4_AES)).await.unwrap_err();
    assert!(matches!(err, SyncError::Consistency { operation: "delete", .. }));

    let orphans = s.store.find_orphans().await.unwrap();
    assert!(orphans.records_without_ref.is_empty());
    assert_eq!(orphans.refs_without_record, vec![RecordKey::new(1, labels::K4_AES)]);
}

#[tokio::test]
async fn test_primary_failure_leaves_nothing_to_compensate() {
    let s = stores(vec![1], vec![]);

    let err = s.store.create(&record(1, "aa")).await.unwrap_err();
    assert!(matches!(err, SyncError::Storage(StorageError::Backend(_))));
    assert!(s.refs.is_empty());
}

// =============================================================================
// Backend + store interplay
// =============================================================================

#[tokio::test]
async fn test_key_manager_removes_backend_key_when_store_rolls_back() {
    let s = stores(vec![], vec![1]);
    let backend = Arc::new(InMemoryBackend::new());
    let gateway = BackendGateway::new(backend.clone(), Arc::new(CircuitState::new()), Duration::from_secs(1));
    let keys = KeyManager::new(gateway, s.store.clone());

    let err = keys.create_key(&record(5, "00112233")).await.unwrap_err();
    assert!(matches!(err, SyncError::RolledBack { .. }));
    assert_eq!(backend.calls("store_key"), 1);
    assert_eq!(backend.calls("delete_key"), 1);
    assert!(!backend.has_key(labels::K4_AES, 5));
}

#[tokio::test]
async fn test_key_sync_cleans_up_generated_key_store_refused() {
    // First internal label's record insert fails
    let s = stores(vec![1], vec![]);
    let backend = Arc::new(InMemoryBackend::new());
    let subscribers = Arc::new(InMemorySubscriberStore::new());
    let coordinator = SyncCoordinator::new(K4SyncConfig::default(), backend.clone(), s.store.clone(), subscribers);

    let TriggerOutcome::Completed(report) = coordinator.trigger_sync_our_keys().await else {
        panic!("our-keys sync should complete");
    };
    let first = &report.our_keys[0];
    assert_eq!(first.label, labels::INTERNAL_LABELS[0]);
    assert!(!first.errors.is_empty());
    assert!(!backend.has_key(first.label.as_str(), 1));

    // The remaining labels are unaffected
    for r in &report.our_keys[1..] {
        assert_eq!(r.created, vec![1]);
    }
}

/// External sync over a store whose `label` listings fail on the given calls.
fn external_sync(label: &str, list_faults: Vec<u64>) -> (KeySyncEngine, Arc<InMemoryBackend>, Arc<InMemoryKeyStore>) {
    let records = Arc::new(InMemoryKeyStore::new());
    let store = Arc::new(TransactionalKeyStore::new(
        Arc::new(FailingKeyStore::new(records.clone(), vec![]).failing_lists(label, list_faults)),
        Arc::new(InMemoryRefStore::new()),
    ));
    let backend = Arc::new(InMemoryBackend::new());
    let gateway = BackendGateway::new(backend.clone(), Arc::new(CircuitState::new()), Duration::from_secs(1));
    (KeySyncEngine::new(gateway, store, 1, true), backend, records)
}

#[tokio::test]
async fn test_unreadable_store_never_deletes_backend_keys() {
    // Every listing after the first fails; one snapshot must be enough
    let (engine, backend, records) = external_sync(labels::K4_DES, vec![2, 3, 4]);
    backend.seed_key(labels::K4_DES, 5, KeyType::Des);
    records.insert(&KeyRecord::new(5, labels::K4_DES, KeyType::Des, "")).await.unwrap();

    let reports = engine.sync_external_keys().await;
    let des = reports.iter().find(|r| r.label == labels::K4_DES).unwrap();
    assert!(des.is_ok(), "{:?}", des.errors);
    assert!(des.missing_in_store.is_empty());
    assert!(des.deleted.is_empty());
    assert!(backend.has_key(labels::K4_DES, 5));
    assert_eq!(backend.calls("delete_key"), 0);
}

#[tokio::test]
async fn test_failed_store_snapshot_aborts_label() {
    let (engine, backend, records) = external_sync(labels::K4_DES, vec![1]);
    backend.seed_key(labels::K4_DES, 5, KeyType::Des);
    records.insert(&KeyRecord::new(5, labels::K4_DES, KeyType::Des, "")).await.unwrap();

    let reports = engine.sync_external_keys().await;
    let des = reports.iter().find(|r| r.label == labels::K4_DES).unwrap();
    assert!(!des.is_ok());
    assert!(des.deleted.is_empty());
    assert!(backend.has_key(labels::K4_DES, 5));
}

#[tokio::test]
async fn test_subscriber_write_failure_does_not_stop_sweep() {
    let inner = Arc::new(InMemorySubscriberStore::new());
    for ue in ["U1", "U2", "U3"] {
        inner.insert(ue, SubscriberKeyState::cleartext("abc123"));
    }
    let subscribers = Arc::new(FailingSubscriberStore {
        inner: inner.clone(),
        reject: HashSet::from(["U2".to_string()]),
    });
    let store = Arc::new(TransactionalKeyStore::new(
        Arc::new(InMemoryKeyStore::new()),
        Arc::new(InMemoryRefStore::new()),
    ));
    let coordinator = SyncCoordinator::new(
        K4SyncConfig::default(),
        Arc::new(InMemoryBackend::new()),
        store,
        subscribers,
    );

    let TriggerOutcome::Completed(report) = coordinator.trigger_sync_users().await else {
        panic!("user sweep should complete");
    };
    assert_eq!(report.users.total, 3);
    assert_eq!(report.users.encrypted, 2);
    assert_eq!(report.users.failed, 1);
    assert_eq!(inner.snapshot("U2").unwrap().permanent_key_value, "abc123");
    assert_eq!(inner.snapshot("U3").unwrap().key_serial_reference, 1);
}

#[tokio::test]
async fn test_encrypt_outage_leaves_cleartext_untouched() {
    let h = common::harness();
    h.subscribers.insert("U1", SubscriberKeyState::cleartext("abc123"));
    h.backend.set_fail_encrypt(true);

    let TriggerOutcome::Completed(report) = h.coordinator.trigger_sync_users().await else {
        panic!("user sweep should complete");
    };
    assert_eq!(report.users.failed, 1);
    assert_eq!(h.subscribers.snapshot("U1").unwrap(), SubscriberKeyState::cleartext("abc123"));
    // A plain backend error is not an auth failure
    assert!(!h.coordinator.circuit().is_down());
}

#[tokio::test]
async fn test_auth_failure_mid_sweep_trips_circuit() {
    let h = common::harness();
    h.backend.set_fail_auth(true);

    let outcome = h.coordinator.trigger_rotation(None).await;
    assert_eq!(outcome.status_code(), 500);
    assert!(h.coordinator.circuit().is_down());

    // Everything after the trip is gated
    h.backend.reset_calls();
    h.coordinator.trigger_sync().await;
    assert_eq!(h.backend.total_calls(), 0);
}
