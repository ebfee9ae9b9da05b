//! Message routing and the dispatcher loop.
//!
//! One consumer drains a bounded multi-producer queue. Alongside it, a
//! ticker injects a full sync every `sync_interval_minutes` (unless
//! `sync_enabled` is false). Timer-driven and message-driven syncs share the
//! same admission locks, so a tick landing on a running sweep is just Busy.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{SyncAction, SyncCoordinator, SyncMessage, TriggerOutcome};

impl SyncCoordinator {
    /// Route one message. Unknown actions are logged and dropped.
    pub async fn dispatch(&self, message: SyncMessage) -> Option<TriggerOutcome> {
        debug!(action = %message.action, "Dispatching sync message");
        let outcome = match &message.action {
            SyncAction::SyncAll => self.trigger_sync().await,
            SyncAction::SyncOurKeys => self.trigger_sync_our_keys().await,
            SyncAction::SyncExternalKeys => self.trigger_sync_external_keys().await,
            SyncAction::SyncUsers => self.trigger_sync_users().await,
            SyncAction::RotateKey => self.trigger_rotation(message.info.as_deref()).await,
            SyncAction::CheckKeyLife => self.trigger_check_key_life().await,
            SyncAction::Unknown(action) => {
                warn!(action = %action, "Unknown sync action ignored");
                return None;
            }
        };

        if !outcome.is_success() {
            info!(action = %message.action, outcome = %outcome, "Sync message not completed");
        }
        if let Some(reply) = message.reply {
            // Requester may have given up waiting
            let _ = reply.send(outcome.clone());
        }
        Some(outcome)
    }

    fn sync_ticker(&self) -> Option<Interval> {
        if !self.config.sync_enabled {
            return None;
        }
        let period = self.config.sync_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(ticker)
    }

    pub(super) async fn run_dispatcher(
        self: Arc<Self>,
        mut messages: mpsc::Receiver<SyncMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = self.sync_ticker();
        info!(periodic = ticker.is_some(), "Sync dispatcher started");

        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(m) => {
                        self.dispatch(m).await;
                    }
                    None => break,
                },
                _ = next_tick(&mut ticker) => {
                    debug!("Periodic sync tick");
                    self.trigger_sync().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Sync dispatcher stopped");
    }
}

/// Never resolves when periodic sync is off.
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
