// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared backend circuit flag.
//!
//! A single down/healthy gate, injected (as `Arc<CircuitState>`) into every
//! component that talks to a backend. Multiple writers, last write wins:
//! the health monitor flips it both ways, and call sites that hit an
//! authentication failure trip it. Reset on restart.
//!
//! States:
//! - Healthy: backend calls proceed
//! - Down: every backend call is rejected before it reaches the network

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};

use crate::metrics;

/// Observable state, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy = 0,
    Down = 1,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Down => write!(f, "down"),
        }
    }
}

pub struct CircuitState {
    backend_down: AtomicBool,
    /// Why the circuit last tripped, if it is down.
    reason: RwLock<Option<String>>,

    // Metrics
    trips: AtomicU64,
    recoveries: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitState {
    /// New circuit, healthy.
    pub fn new() -> Self {
        Self {
            backend_down: AtomicBool::new(false),
            reason: RwLock::new(None),
            trips: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn is_down(&self) -> bool {
        self.backend_down.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn state(&self) -> HealthState {
        if self.is_down() {
            HealthState::Down
        } else {
            HealthState::Healthy
        }
    }

    /// Mark the backend down. Logs only on the healthy -> down edge.
    pub fn trip(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let was_down = self.backend_down.swap(true, Ordering::AcqRel);
        if !was_down {
            self.trips.fetch_add(1, Ordering::Relaxed);
            warn!(reason = %reason, "Backend circuit tripped");
            metrics::set_circuit_state(HealthState::Down);
        }
        *self.reason.write() = Some(reason);
    }

    /// Mark the backend healthy. Logs only on the down -> healthy edge.
    pub fn mark_healthy(&self) {
        let was_down = self.backend_down.swap(false, Ordering::AcqRel);
        if was_down {
            self.recoveries.fetch_add(1, Ordering::Relaxed);
            info!("Backend circuit recovered");
            metrics::set_circuit_state(HealthState::Healthy);
        }
        *self.reason.write() = None;
    }

    /// Count a call that was refused because the circuit is down.
    pub fn record_rejection(&self, operation: &str) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        metrics::record_circuit_rejection(operation);
    }

    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    #[must_use]
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

impl Default for CircuitState {
    fn default() -> Self {
        Self::new()
    }
}
