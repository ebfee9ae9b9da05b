// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for k4-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `k4_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `backend`: hsm, transit, disabled, memory
//! - `operation`: login, create_key, store_key, encrypt, rewrap, ...
//! - `status`: success, error, rejected, timeout

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::resilience::circuit::HealthState;

// ═══════════════════════════════════════════════════════════════════════════
// Backend calls
// ═══════════════════════════════════════════════════════════════════════════

/// Record a backend call outcome
pub fn record_backend_call(backend: &str, operation: &str, status: &str) {
    counter!(
        "k4_sync_backend_calls_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record backend call latency
pub fn record_backend_latency(backend: &str, operation: &str, duration: Duration) {
    histogram!(
        "k4_sync_backend_call_seconds",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a login attempt
pub fn record_login(backend: &str, success: bool) {
    counter!(
        "k4_sync_backend_logins_total",
        "backend" => backend.to_string(),
        "status" => if success { "success" } else { "error" }.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Circuit
// ═══════════════════════════════════════════════════════════════════════════

/// Set circuit state gauge (0 = healthy, 1 = down)
pub fn set_circuit_state(state: HealthState) {
    gauge!("k4_sync_circuit_state").set(state as u8 as f64);
}

/// Record a call rejected because the circuit is down
pub fn record_circuit_rejection(operation: &str) {
    counter!(
        "k4_sync_circuit_rejections_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a health probe outcome
pub fn record_health_probe(status: &str) {
    counter!(
        "k4_sync_health_probes_total",
        "status" => status.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Key store
// ═══════════════════════════════════════════════════════════════════════════

/// Record a two-phase write that was compensated cleanly
pub fn record_rollback(operation: &str) {
    counter!(
        "k4_sync_store_rollbacks_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a failed compensation. Every increment needs an operator.
pub fn record_consistency_error(operation: &str) {
    counter!(
        "k4_sync_store_consistency_errors_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Sweeps
// ═══════════════════════════════════════════════════════════════════════════

/// Record a sweep outcome (sweep: full, our_keys, external_keys, users)
pub fn record_sweep(sweep: &str, status: &str) {
    counter!(
        "k4_sync_sweeps_total",
        "sweep" => sweep.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record sweep duration
pub fn record_sweep_latency(sweep: &str, duration: Duration) {
    histogram!(
        "k4_sync_sweep_seconds",
        "sweep" => sweep.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a trigger refused by admission control
pub fn record_busy(class: &str) {
    counter!(
        "k4_sync_busy_rejections_total",
        "class" => class.to_string()
    )
    .increment(1);
}

/// Record what happened to one subscriber in a user sweep
pub fn record_subscriber_outcome(outcome: &str) {
    counter!(
        "k4_sync_subscribers_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a per-label key sync action (adopted, created, mirrored, deleted, missing)
pub fn record_key_sync_action(label: &str, action: &str, count: usize) {
    counter!(
        "k4_sync_key_sync_actions_total",
        "label" => label.to_string(),
        "action" => action.to_string()
    )
    .increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// Rotation
// ═══════════════════════════════════════════════════════════════════════════

/// Record a key rotation attempt
pub fn record_rotation(label: &str, status: &str) {
    counter!(
        "k4_sync_rotations_total",
        "label" => label.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a rewrap decision (current, rewrapped, error)
pub fn record_rewrap(outcome: &str) {
    counter!(
        "k4_sync_rewraps_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set latest known backend key version
pub fn set_key_version(label: &str, version: u64) {
    gauge!(
        "k4_sync_key_version",
        "label" => label.to_string()
    )
    .set(version as f64);
}

/// RAII timer for sweeps; records on drop.
pub struct LatencyTimer {
    sweep: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(sweep: &'static str) -> Self {
        Self {
            sweep,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_sweep_latency(self.sweep, self.start.elapsed());
    }
}

/// Convenience macro for timing a sweep
#[macro_export]
macro_rules! time_sweep {
    ($sweep:expr) => {
        $crate::metrics::LatencyTimer::new($sweep)
    };
}
