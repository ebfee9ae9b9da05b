use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use crate::key_record::{KeyRecord, RecordKey};
use crate::subscriber::SubscriberKeyState;
use super::traits::{KeyRecordStore, KeyRefStore, StorageError, SubscriberStore};

/// Primary key collection backed by a `DashMap`.
pub struct InMemoryKeyStore {
    data: DashMap<RecordKey, KeyRecord>,
}

impl InMemoryKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current record count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clear all records
    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for InMemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted(mut records: Vec<KeyRecord>) -> Vec<KeyRecord> {
    records.sort_by(|a, b| (&a.label, a.serial).cmp(&(&b.label, b.serial)));
    records
}

#[async_trait]
impl KeyRecordStore for InMemoryKeyStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<KeyRecord>, StorageError> {
        Ok(self.data.get(key).map(|r| r.value().clone()))
    }

    async fn list_by_label(&self, label: &str) -> Result<Vec<KeyRecord>, StorageError> {
        Ok(sorted(
            self.data
                .iter()
                .filter(|r| r.key().label == label)
                .map(|r| r.value().clone())
                .collect(),
        ))
    }

    async fn list_all(&self) -> Result<Vec<KeyRecord>, StorageError> {
        Ok(sorted(self.data.iter().map(|r| r.value().clone()).collect()))
    }

    async fn insert(&self, record: &KeyRecord) -> Result<(), StorageError> {
        use dashmap::mapref::entry::Entry;
        match self.data.entry(record.key()) {
            Entry::Occupied(_) => Err(StorageError::Duplicate {
                serial: record.serial,
                label: record.label.clone(),
            }),
            Entry::Vacant(v) => {
                v.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn put(&self, record: &KeyRecord) -> Result<(), StorageError> {
        self.data.insert(record.key(), record.clone());
        Ok(())
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }
}

/// Cross-reference collection backed by a `DashSet`.
#[derive(Default)]
pub struct InMemoryRefStore {
    refs: DashSet<RecordKey>,
}

impl InMemoryRefStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

#[async_trait]
impl KeyRefStore for InMemoryRefStore {
    async fn insert_ref(&self, key: &RecordKey) -> Result<(), StorageError> {
        if self.refs.insert(key.clone()) {
            Ok(())
        } else {
            Err(StorageError::Duplicate {
                serial: key.serial,
                label: key.label.clone(),
            })
        }
    }

    async fn put_ref(&self, key: &RecordKey) -> Result<(), StorageError> {
        self.refs.insert(key.clone());
        Ok(())
    }

    async fn delete_ref(&self, key: &RecordKey) -> Result<(), StorageError> {
        self.refs.remove(key);
        Ok(())
    }

    async fn has_ref(&self, key: &RecordKey) -> Result<bool, StorageError> {
        Ok(self.refs.contains(key))
    }

    async fn list_refs(&self) -> Result<Vec<RecordKey>, StorageError> {
        let mut refs: Vec<RecordKey> = self.refs.iter().map(|r| r.key().clone()).collect();
        refs.sort();
        Ok(refs)
    }
}

/// Subscriber key states keyed by subscriber id.
#[derive(Default)]
pub struct InMemorySubscriberStore {
    data: DashMap<String, SubscriberKeyState>,
}

impl InMemorySubscriberStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a subscriber.
    pub fn insert(&self, ue_id: impl Into<String>, state: SubscriberKeyState) {
        self.data.insert(ue_id.into(), state);
    }

    /// Synchronous peek, for assertions.
    #[must_use]
    pub fn snapshot(&self, ue_id: &str) -> Option<SubscriberKeyState> {
        self.data.get(ue_id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl SubscriberStore for InMemorySubscriberStore {
    async fn list_subscribers(&self) -> Result<Vec<String>, StorageError> {
        let mut ids: Vec<String> = self.data.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_key_state(&self, ue_id: &str) -> Result<Option<SubscriberKeyState>, StorageError> {
        Ok(self.snapshot(ue_id))
    }

    async fn update_key_state(&self, ue_id: &str, state: &SubscriberKeyState) -> Result<(), StorageError> {
        match self.data.get_mut(ue_id) {
            Some(mut entry) => {
                *entry = state.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound),
        }
    }
}
