// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL storage for key records, their references and subscriber key state.
//!
//! One pool serves all three collections:
//! ```sql
//! CREATE TABLE k4_keys (
//!   k4 TEXT NOT NULL,            -- opaque value (cleartext or backend handle)
//!   k4_sno BIGINT NOT NULL,
//!   key_label VARCHAR(64) NOT NULL,
//!   key_type VARCHAR(16) NOT NULL,
//!   PRIMARY KEY (k4_sno, key_label)
//! )
//! CREATE TABLE k4_key_refs (k4_sno BIGINT, key_label VARCHAR(64), PRIMARY KEY (k4_sno, key_label))
//! CREATE TABLE subscriber_keys (ue_id VARCHAR(64) PRIMARY KEY, ...)
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! MySQL TEXT columns come back as BLOB through the `Any` driver, so every
//! string column is read as `String` first and `Vec<u8>` second.

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, any::AnyRow, AnyPool, Row};
use std::sync::Once;
use std::time::Duration;

use super::traits::{KeyRecordStore, KeyRefStore, StorageError, SubscriberStore};
use crate::key_record::{KeyRecord, KeyType, RecordKey};
use crate::resilience::retry::{retry, RetryConfig};
use crate::subscriber::SubscriberKeyState;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn text(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    row.try_get::<String, _>(column)
        .ok()
        .or_else(|| {
            row.try_get::<Vec<u8>, _>(column)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
        .ok_or_else(|| StorageError::Backend(format!("column '{column}' is not text")))
}

fn serial(row: &AnyRow, column: &str) -> Result<u32, StorageError> {
    let raw: i64 = row.try_get(column).map_err(backend_err)?;
    u32::try_from(raw).map_err(|_| StorageError::Backend(format!("{column} out of range: {raw}")))
}

fn record_from_row(row: &AnyRow) -> Result<KeyRecord, StorageError> {
    let key_type: KeyType = text(row, "key_type")?
        .parse()
        .map_err(|e: crate::error::SyncError| StorageError::Backend(e.to_string()))?;
    Ok(KeyRecord {
        value: text(row, "k4")?,
        serial: serial(row, "k4_sno")?,
        label: text(row, "key_label")?,
        key_type,
    })
}

pub struct SqlKeyStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlKeyStore {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 10 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend_err)
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: [&str; 3] = if self.is_sqlite {
            [
                r#"
                CREATE TABLE IF NOT EXISTS k4_keys (
                    k4 TEXT NOT NULL,
                    k4_sno INTEGER NOT NULL,
                    key_label TEXT NOT NULL,
                    key_type TEXT NOT NULL,
                    PRIMARY KEY (k4_sno, key_label)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS k4_key_refs (
                    k4_sno INTEGER NOT NULL,
                    key_label TEXT NOT NULL,
                    PRIMARY KEY (k4_sno, key_label)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS subscriber_keys (
                    ue_id TEXT PRIMARY KEY,
                    permanent_key_value TEXT NOT NULL,
                    encryption_algorithm INTEGER NOT NULL DEFAULT 0,
                    key_serial_reference INTEGER NOT NULL DEFAULT 0,
                    aad TEXT NOT NULL DEFAULT '',
                    encryption_key_reference TEXT NOT NULL DEFAULT ''
                )
                "#,
            ]
        } else {
            [
                r#"
                CREATE TABLE IF NOT EXISTS k4_keys (
                    k4 TEXT NOT NULL,
                    k4_sno BIGINT NOT NULL,
                    key_label VARCHAR(64) NOT NULL,
                    key_type VARCHAR(16) NOT NULL,
                    PRIMARY KEY (k4_sno, key_label),
                    INDEX idx_label (key_label)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS k4_key_refs (
                    k4_sno BIGINT NOT NULL,
                    key_label VARCHAR(64) NOT NULL,
                    PRIMARY KEY (k4_sno, key_label)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS subscriber_keys (
                    ue_id VARCHAR(64) PRIMARY KEY,
                    permanent_key_value TEXT NOT NULL,
                    encryption_algorithm INT NOT NULL DEFAULT 0,
                    key_serial_reference BIGINT NOT NULL DEFAULT 0,
                    aad TEXT NOT NULL,
                    encryption_key_reference VARCHAR(128) NOT NULL DEFAULT ''
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(backend_err)
            })
            .await?;
        }

        Ok(())
    }

    /// Seed or overwrite a subscriber's key state.
    pub async fn upsert_subscriber(&self, ue_id: &str, state: &SubscriberKeyState) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO subscriber_keys (ue_id, permanent_key_value, encryption_algorithm, key_serial_reference, aad, encryption_key_reference)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(ue_id) DO UPDATE SET
                permanent_key_value = excluded.permanent_key_value,
                encryption_algorithm = excluded.encryption_algorithm,
                key_serial_reference = excluded.key_serial_reference,
                aad = excluded.aad,
                encryption_key_reference = excluded.encryption_key_reference"
        } else {
            "INSERT INTO subscriber_keys (ue_id, permanent_key_value, encryption_algorithm, key_serial_reference, aad, encryption_key_reference)
             VALUES (?, ?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                permanent_key_value = VALUES(permanent_key_value),
                encryption_algorithm = VALUES(encryption_algorithm),
                key_serial_reference = VALUES(key_serial_reference),
                aad = VALUES(aad),
                encryption_key_reference = VALUES(encryption_key_reference)"
        };

        sqlx::query(sql)
            .bind(ue_id)
            .bind(&state.permanent_key_value)
            .bind(i64::from(state.encryption_algorithm))
            .bind(i64::from(state.key_serial_reference))
            .bind(&state.aad)
            .bind(&state.encryption_key_reference)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}

#[async_trait]
impl KeyRecordStore for SqlKeyStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<KeyRecord>, StorageError> {
        retry("sql_get_key", &RetryConfig::query(), || async {
            let row = sqlx::query(
                "SELECT k4, k4_sno, key_label, key_type FROM k4_keys WHERE k4_sno = ? AND key_label = ?",
            )
            .bind(i64::from(key.serial))
            .bind(&key.label)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;

            row.as_ref().map(record_from_row).transpose()
        })
        .await
    }

    async fn list_by_label(&self, label: &str) -> Result<Vec<KeyRecord>, StorageError> {
        retry("sql_list_keys", &RetryConfig::query(), || async {
            let rows = sqlx::query(
                "SELECT k4, k4_sno, key_label, key_type FROM k4_keys WHERE key_label = ? ORDER BY k4_sno",
            )
            .bind(label)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

            rows.iter().map(record_from_row).collect()
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<KeyRecord>, StorageError> {
        retry("sql_list_keys", &RetryConfig::query(), || async {
            let rows = sqlx::query(
                "SELECT k4, k4_sno, key_label, key_type FROM k4_keys ORDER BY key_label, k4_sno",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

            rows.iter().map(record_from_row).collect()
        })
        .await
    }

    async fn insert(&self, record: &KeyRecord) -> Result<(), StorageError> {
        let result = sqlx::query("INSERT INTO k4_keys (k4, k4_sno, key_label, key_type) VALUES (?, ?, ?, ?)")
            .bind(&record.value)
            .bind(i64::from(record.serial))
            .bind(&record.label)
            .bind(record.key_type.as_str())
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StorageError::Duplicate {
                serial: record.serial,
                label: record.label.clone(),
            }),
            Err(e) => Err(backend_err(e)),
        }
    }

    async fn put(&self, record: &KeyRecord) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO k4_keys (k4, k4_sno, key_label, key_type) VALUES (?, ?, ?, ?)
             ON CONFLICT(k4_sno, key_label) DO UPDATE SET k4 = excluded.k4, key_type = excluded.key_type"
        } else {
            "INSERT INTO k4_keys (k4, k4_sno, key_label, key_type) VALUES (?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE k4 = VALUES(k4), key_type = VALUES(key_type)"
        };

        sqlx::query(sql)
            .bind(&record.value)
            .bind(i64::from(record.serial))
            .bind(&record.label)
            .bind(record.key_type.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM k4_keys WHERE k4_sno = ? AND key_label = ?")
            .bind(i64::from(key.serial))
            .bind(&key.label)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}

#[async_trait]
impl KeyRefStore for SqlKeyStore {
    async fn insert_ref(&self, key: &RecordKey) -> Result<(), StorageError> {
        let result = sqlx::query("INSERT INTO k4_key_refs (k4_sno, key_label) VALUES (?, ?)")
            .bind(i64::from(key.serial))
            .bind(&key.label)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StorageError::Duplicate {
                serial: key.serial,
                label: key.label.clone(),
            }),
            Err(e) => Err(backend_err(e)),
        }
    }

    async fn put_ref(&self, key: &RecordKey) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT OR IGNORE INTO k4_key_refs (k4_sno, key_label) VALUES (?, ?)"
        } else {
            "INSERT IGNORE INTO k4_key_refs (k4_sno, key_label) VALUES (?, ?)"
        };
        sqlx::query(sql)
            .bind(i64::from(key.serial))
            .bind(&key.label)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn delete_ref(&self, key: &RecordKey) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM k4_key_refs WHERE k4_sno = ? AND key_label = ?")
            .bind(i64::from(key.serial))
            .bind(&key.label)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn has_ref(&self, key: &RecordKey) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT k4_sno FROM k4_key_refs WHERE k4_sno = ? AND key_label = ?")
            .bind(i64::from(key.serial))
            .bind(&key.label)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(row.is_some())
    }

    async fn list_refs(&self) -> Result<Vec<RecordKey>, StorageError> {
        let rows = sqlx::query("SELECT k4_sno, key_label FROM k4_key_refs ORDER BY key_label, k4_sno")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        rows.iter()
            .map(|row| Ok(RecordKey::new(serial(row, "k4_sno")?, text(row, "key_label")?)))
            .collect()
    }
}

#[async_trait]
impl SubscriberStore for SqlKeyStore {
    async fn list_subscribers(&self) -> Result<Vec<String>, StorageError> {
        retry("sql_list_subscribers", &RetryConfig::query(), || async {
            let rows = sqlx::query("SELECT ue_id FROM subscriber_keys ORDER BY ue_id")
                .fetch_all(&self.pool)
                .await
                .map_err(backend_err)?;
            rows.iter().map(|row| text(row, "ue_id")).collect()
        })
        .await
    }

    async fn get_key_state(&self, ue_id: &str) -> Result<Option<SubscriberKeyState>, StorageError> {
        let row = sqlx::query(
            "SELECT permanent_key_value, encryption_algorithm, key_serial_reference, aad, encryption_key_reference
             FROM subscriber_keys WHERE ue_id = ?",
        )
        .bind(ue_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let algorithm: i64 = row.try_get("encryption_algorithm").map_err(backend_err)?;
        Ok(Some(SubscriberKeyState {
            permanent_key_value: text(&row, "permanent_key_value")?,
            encryption_algorithm: i32::try_from(algorithm)
                .map_err(|_| StorageError::Backend(format!("encryption_algorithm out of range: {algorithm}")))?,
            key_serial_reference: serial(&row, "key_serial_reference")?,
            aad: text(&row, "aad").unwrap_or_default(),
            encryption_key_reference: text(&row, "encryption_key_reference").unwrap_or_default(),
        }))
    }

    async fn update_key_state(&self, ue_id: &str, state: &SubscriberKeyState) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE subscriber_keys SET permanent_key_value = ?, encryption_algorithm = ?,
                key_serial_reference = ?, aad = ?, encryption_key_reference = ?
             WHERE ue_id = ?",
        )
        .bind(&state.permanent_key_value)
        .bind(i64::from(state.encryption_algorithm))
        .bind(i64::from(state.key_serial_reference))
        .bind(&state.aad)
        .bind(&state.encryption_key_reference)
        .bind(ue_id)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}
