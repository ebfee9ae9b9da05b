//! Public types for the sync coordinator.

use std::fmt;
use tokio::sync::oneshot;

use crate::key_sync::LabelSyncReport;
use crate::user_sync::SweepReport;

/// Action carried by a [`SyncMessage`].
///
/// Parsed case-insensitively from the wire vocabulary; anything unrecognised
/// becomes [`SyncAction::Unknown`] and is logged and dropped by the
/// dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Our keys, then external keys, then users.
    SyncAll,
    SyncOurKeys,
    SyncExternalKeys,
    SyncUsers,
    /// Rotate the internal key (or the label in the message info)
    RotateKey,
    CheckKeyLife,
    Unknown(String),
}

impl SyncAction {
    #[must_use]
    pub fn parse(action: &str) -> Self {
        match action.trim().to_ascii_uppercase().as_str() {
            "SYNC_ALL" | "SYNC" => Self::SyncAll,
            "SYNC_OUR_KEYS" => Self::SyncOurKeys,
            "SYNC_EXTERNAL_KEYS" => Self::SyncExternalKeys,
            "SYNC_USERS" => Self::SyncUsers,
            "ROTATE_KEY" | "ROTATE_INTERNAL_KEY" | "ROTATE_K4" => Self::RotateKey,
            "CHECK_KEY_LIFE" => Self::CheckKeyLife,
            _ => Self::Unknown(action.to_string()),
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SyncAll => write!(f, "SYNC_ALL"),
            Self::SyncOurKeys => write!(f, "SYNC_OUR_KEYS"),
            Self::SyncExternalKeys => write!(f, "SYNC_EXTERNAL_KEYS"),
            Self::SyncUsers => write!(f, "SYNC_USERS"),
            Self::RotateKey => write!(f, "ROTATE_KEY"),
            Self::CheckKeyLife => write!(f, "CHECK_KEY_LIFE"),
            Self::Unknown(s) => write!(f, "UNKNOWN({s})"),
        }
    }
}

/// A request for the dispatcher.
#[derive(Debug)]
pub struct SyncMessage {
    pub action: SyncAction,
    /// Free-form argument; for `ROTATE_KEY`, the label to rotate.
    pub info: Option<String>,
    /// Receives the outcome, if the sender wants one.
    pub reply: Option<oneshot::Sender<TriggerOutcome>>,
}

impl SyncMessage {
    #[must_use]
    pub fn new(action: SyncAction) -> Self {
        Self { action, info: None, reply: None }
    }

    /// Build from a wire action string.
    #[must_use]
    pub fn parse(action: &str) -> Self {
        Self::new(SyncAction::parse(action))
    }

    #[must_use]
    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }
}

/// Everything a full synchronization pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullSyncReport {
    pub our_keys: Vec<LabelSyncReport>,
    pub external_keys: Vec<LabelSyncReport>,
    pub users: SweepReport,
}

/// Result of a trigger, shaped for the HTTP adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Completed(Box<FullSyncReport>),
    Rotated { label: String },
    KeyLife { label: String, version: u64 },
    /// Another operation of the same class holds the lock
    Busy,
    NotImplemented(String),
    /// Short diagnostic, never a backtrace
    Failed(String),
}

impl TriggerOutcome {
    /// HTTP status equivalent.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Completed(_) | Self::Rotated { .. } | Self::KeyLife { .. } => 200,
            Self::Busy => 429,
            Self::NotImplemented(_) => 501,
            Self::Failed(_) => 500,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status_code() == 200
    }

    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Completed(_) => "sync completed".to_string(),
            Self::Rotated { label } => format!("key {label} rotated"),
            Self::KeyLife { label, version } => format!("key {label} at version {version}"),
            Self::Busy => "operation already in progress".to_string(),
            Self::NotImplemented(what) => format!("{what} not implemented"),
            Self::Failed(reason) => reason.clone(),
        }
    }
}

impl fmt::Display for TriggerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status_code(), self.message())
    }
}
