// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic backend health probing.
//!
//! Two states, `HEALTHY` and `DOWN`, mirrored into the shared
//! [`CircuitState`]. An authentication-expired probe gets exactly one
//! inline re-login and re-probe before the backend is declared down.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backend::{BackendGateway, ProbeStatus};
use crate::metrics;
use crate::resilience::circuit::{CircuitState, HealthState};

pub struct HealthMonitor {
    gateway: BackendGateway,
    interval: Duration,
    /// Prevents overlapping probes (loop tick vs. manual probe).
    checking: Mutex<()>,
}

impl HealthMonitor {
    pub fn new(gateway: BackendGateway, interval: Duration) -> Self {
        Self {
            gateway,
            interval,
            checking: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn circuit(&self) -> &Arc<CircuitState> {
        self.gateway.circuit()
    }

    /// Probe once and update the circuit.
    pub async fn probe_once(&self) -> HealthState {
        let _guard = self.checking.lock().await;

        let status = match self.gateway.health_probe().await {
            ProbeStatus::AuthExpired => {
                info!(backend = self.gateway.name(), "Backend session expired, re-authenticating");
                match self.gateway.relogin().await {
                    Ok(_) => self.gateway.health_probe().await,
                    Err(e) => ProbeStatus::Unhealthy(format!("re-authentication failed: {e}")),
                }
            }
            other => other,
        };

        let circuit = self.gateway.circuit();
        match status {
            ProbeStatus::Healthy => {
                metrics::record_health_probe("ok");
                debug!(backend = self.gateway.name(), "Backend healthy");
                circuit.mark_healthy();
                HealthState::Healthy
            }
            ProbeStatus::Unhealthy(reason) => {
                metrics::record_health_probe("unhealthy");
                warn!(backend = self.gateway.name(), reason = %reason, "Backend probe failed");
                circuit.trip(reason);
                HealthState::Down
            }
            ProbeStatus::AuthExpired => {
                metrics::record_health_probe("auth_expired");
                circuit.trip("authentication expired after re-login");
                HealthState::Down
            }
        }
    }

    /// Probe on every tick until `shutdown` flips to true (or its sender
    /// goes away). The first probe runs immediately.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            backend = self.gateway.name(),
            interval_secs = self.interval.as_secs(),
            "Health monitor started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Health monitor stopped");
    }
}
