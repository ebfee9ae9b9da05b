// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the key-lifecycle engine.
//!
//! Every failure surfaced above the storage layer is a [`SyncError`]. Callers
//! that need to apply a uniform propagation policy (skip, trip the circuit,
//! shout at the operator) should branch on [`SyncError::kind`] rather than on
//! individual variants.

use std::time::Duration;
use thiserror::Error;

use crate::storage::traits::StorageError;

/// Coarse classification used by the propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Login or session failure. Trips the circuit.
    Auth,
    /// Circuit is down; nothing was sent.
    BackendUnavailable,
    /// Rejected before any network or database call. Never retried.
    Validation,
    /// Two-phase write diverged and compensation failed. Needs an operator.
    Consistency,
    /// Referenced key or subscriber is absent.
    NotFound,
    /// Anything a later sweep may succeed at.
    Transient,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Auth => write!(f, "auth"),
            ErrorKind::BackendUnavailable => write!(f, "backend_unavailable"),
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Consistency => write!(f, "consistency"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Transient => write!(f, "transient"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Authentication with backend failed: {0}")]
    Auth(String),

    #[error("Backend unavailable (circuit down)")]
    BackendUnavailable,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unsupported key label: {0}")]
    UnsupportedLabel(String),

    #[error("Invalid ciphertext format: {0}")]
    InvalidCiphertextFormat(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Second phase failed and so did the compensating write. The two
    /// collections now disagree.
    #[error("Consistency error during {operation}: {original}; compensation failed: {compensation}")]
    Consistency {
        operation: &'static str,
        original: StorageError,
        compensation: StorageError,
    },

    /// Second phase failed but the first phase was undone cleanly.
    #[error("{operation} rolled back: {source}")]
    RolledBack {
        operation: &'static str,
        #[source]
        source: StorageError,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Backend '{backend}' does not support {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),
}

impl SyncError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Auth(_) => ErrorKind::Auth,
            SyncError::BackendUnavailable => ErrorKind::BackendUnavailable,
            SyncError::Validation(_)
            | SyncError::UnsupportedLabel(_)
            | SyncError::InvalidCiphertextFormat(_)
            | SyncError::Unsupported { .. } => ErrorKind::Validation,
            SyncError::Consistency { .. } => ErrorKind::Consistency,
            SyncError::NotFound(_) | SyncError::Storage(StorageError::NotFound) => {
                ErrorKind::NotFound
            }
            SyncError::RolledBack { .. }
            | SyncError::Storage(_)
            | SyncError::Backend(_)
            | SyncError::Timeout(_) => ErrorKind::Transient,
        }
    }

    /// True for failures that say something about backend reachability.
    /// These feed the circuit rather than propagating as hard errors.
    #[must_use]
    pub fn is_backend_fault(&self) -> bool {
        matches!(
            self,
            SyncError::Auth(_) | SyncError::Backend(_) | SyncError::Timeout(_)
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Backend(e.to_string())
    }
}
