use async_trait::async_trait;
use thiserror::Error;

use crate::key_record::{KeyRecord, RecordKey};
use crate::subscriber::SubscriberKeyState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Duplicate key record {label}#{serial}")]
    Duplicate { serial: u32, label: String },
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Primary key-record collection.
#[async_trait]
pub trait KeyRecordStore: Send + Sync {
    async fn get(&self, key: &RecordKey) -> Result<Option<KeyRecord>, StorageError>;
    async fn list_by_label(&self, label: &str) -> Result<Vec<KeyRecord>, StorageError>;
    async fn list_all(&self) -> Result<Vec<KeyRecord>, StorageError>;

    /// Insert a new record. Fails with [`StorageError::Duplicate`] if the
    /// `(serial, label)` pair already exists.
    async fn insert(&self, record: &KeyRecord) -> Result<(), StorageError>;

    /// Insert or replace.
    async fn put(&self, record: &KeyRecord) -> Result<(), StorageError>;

    /// Remove a record. Absent records are not an error.
    async fn delete(&self, key: &RecordKey) -> Result<(), StorageError>;

    async fn exists(&self, key: &RecordKey) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Cross-reference collection. Carries identity only; used to detect
/// orphans after a failed compensation.
#[async_trait]
pub trait KeyRefStore: Send + Sync {
    async fn insert_ref(&self, key: &RecordKey) -> Result<(), StorageError>;
    async fn put_ref(&self, key: &RecordKey) -> Result<(), StorageError>;
    async fn delete_ref(&self, key: &RecordKey) -> Result<(), StorageError>;
    async fn has_ref(&self, key: &RecordKey) -> Result<bool, StorageError>;
    async fn list_refs(&self) -> Result<Vec<RecordKey>, StorageError>;
}

/// Key material embedded in subscriber records. Everything else about a
/// subscriber lives elsewhere.
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    async fn list_subscribers(&self) -> Result<Vec<String>, StorageError>;
    async fn get_key_state(&self, ue_id: &str) -> Result<Option<SubscriberKeyState>, StorageError>;
    async fn update_key_state(&self, ue_id: &str, state: &SubscriberKeyState) -> Result<(), StorageError>;
}
