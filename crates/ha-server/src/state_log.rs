//! Logs every state change written by the integrations

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ha_state_machine::{StateChanged, StateMachine};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub struct StateLogger {
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
    seen: Arc<AtomicUsize>,
}

impl StateLogger {
    /// Subscribe to `states` and start logging in a background task
    pub fn start(states: &StateMachine) -> Self {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let mut changes = states.subscribe();
        let running = Arc::new(AtomicBool::new(true));
        let seen = Arc::new(AtomicUsize::new(0));

        let task_running = Arc::clone(&running);
        let task_seen = Arc::clone(&seen);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok(change) => {
                            task_seen.fetch_add(1, Ordering::SeqCst);
                            log_change(&change);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("State logger lagged by {} changes", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("State machine closed, stopping state logger");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        debug!("State logger stopped");
                        break;
                    }
                }
            }
            task_running.store(false, Ordering::SeqCst);
        });

        Self {
            shutdown_tx,
            running,
            seen,
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of changes received so far
    pub fn seen(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }
}

fn log_change(change: &StateChanged) {
    match &change.new_state {
        Some(new) if change.value_changed() => {
            info!(entity_id = %change.entity_id, "{} -> {}", old_value(change), new.state);
        }
        Some(_) => debug!(entity_id = %change.entity_id, "Attributes updated"),
        None => info!(entity_id = %change.entity_id, "Removed"),
    }
}

fn old_value(change: &StateChanged) -> &str {
    change
        .old_state
        .as_ref()
        .map_or("(new)", |old| old.state.as_str())
}
