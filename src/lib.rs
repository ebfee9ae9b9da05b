//! # K4 Sync
//!
//! Keeps K4 transport keys and subscriber permanent-key material in step
//! with an external key backend (an HSM-style key-management service or a
//! transit secret store).
//!
//! ## Architecture
//!
//! ```text
//!        HTTP adapter / timers
//!                 │  SyncMessage (bounded mpsc)
//!                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SyncCoordinator                        │
//! │  • try_lock admission: at most one sweep per class          │
//! │  • our keys → external keys (per label, concurrent) → users │
//! └─────────────────────────────────────────────────────────────┘
//!        │                 │                    │
//!        ▼                 ▼                    ▼
//!  KeySyncEngine   UserDataSyncEngine   KeyRotationEngine
//!  KeyManager      (task per subscriber) (rotate, rewrap)
//!        │                 │                    │
//!        ▼                 └─────────┬──────────┘
//!  TransactionalKeyStore             ▼
//!  (primary + reference,      BackendGateway ◄── CircuitState ◄── HealthMonitor
//!   compensating rollback)           │
//!                                    ▼
//!                     dyn KeyBackend (hsm | transit | disabled)
//! ```
//!
//! Every backend call goes through the [`BackendGateway`]: labels are
//! validated before any network call, nothing is sent while the circuit is
//! DOWN, and each call is bounded by a timeout. The [`HealthMonitor`] is the
//! only component that closes the circuit again.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use k4_sync::{K4SyncConfig, SyncCoordinator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = K4SyncConfig {
//!         sql_url: Some("sqlite://k4.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!
//!     let coordinator = Arc::new(SyncCoordinator::connect(config).await.expect("connect"));
//!     let handle = coordinator.clone().spawn();
//!
//!     // What the HTTP layer does for `POST sync`
//!     let outcome = coordinator.trigger_sync().await;
//!     println!("{} {}", outcome.status_code(), outcome.message());
//!
//!     handle.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: admission control, dispatcher loop, lifecycle
//! - [`backend`]: backend trait, gateway, HSM/transit/disabled/in-memory backends
//! - [`health`]: periodic probe driving the circuit
//! - [`key_sync`]: per-label store/backend reconciliation
//! - [`keys`]: single-key create/update/delete
//! - [`rotation`]: key rotation and ciphertext rewrap
//! - [`user_sync`]: subscriber permanent-key sweep
//! - [`storage`]: key record, reference and subscriber stores
//! - [`resilience`]: circuit flag and retry policy

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod key_record;
pub mod key_sync;
pub mod keys;
pub mod labels;
pub mod metrics;
pub mod resilience;
pub mod rotation;
pub mod storage;
pub mod subscriber;
pub mod user_sync;

pub use backend::{BackendGateway, KeyBackend, ProbeStatus};
pub use config::{BackendKind, HsmConfig, K4SyncConfig, TransitConfig};
pub use coordinator::{CoordinatorHandle, FullSyncReport, SyncAction, SyncCoordinator, SyncMessage, TriggerOutcome};
pub use error::{ErrorKind, SyncError};
pub use health::HealthMonitor;
pub use key_record::{KeyRecord, KeyType, RecordKey};
pub use key_sync::{KeySyncEngine, LabelSyncReport};
pub use keys::KeyManager;
pub use metrics::LatencyTimer;
pub use resilience::circuit::{CircuitState, HealthState};
pub use resilience::retry::RetryConfig;
pub use rotation::{ciphertext_version, KeyRotationEngine, RewrapOutcome};
pub use storage::traits::{KeyRecordStore, KeyRefStore, StorageError, SubscriberStore};
pub use storage::transactional::{OrphanReport, TransactionalKeyStore};
pub use subscriber::{KeyStatus, SubscriberKeyState};
pub use user_sync::{SubscriberOutcome, SweepReport, UserDataSyncEngine};
