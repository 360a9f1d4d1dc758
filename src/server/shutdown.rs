use std::collections::HashSet;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::server::delivery::DeliveryEngine;
use crate::server::message::{Message, Severity};
use crate::server::session::SessionRegistry;

/// Warning broadcast to every connected client before the drain closes
/// their connections.
pub const SHUTDOWN_NOTICE: &str = "Server is shutting down. Please reconnect later.";

/// Lifecycle of the drain sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Running,
    Draining,
    Stopped,
}

/// Coordinates graceful shutdown: stop the heartbeat loop, notify every
/// client, close every transport, and leave the registry empty.
///
/// The whole drain runs under one async mutex, which makes the sequence
/// re-entrant-safe: a second caller parks on the lock until the first
/// drain finishes and then observes `Stopped` and returns immediately.
pub struct ShutdownCoordinator {
    registry: SessionRegistry,
    delivery: DeliveryEngine,
    shutdown_tx: watch::Sender<bool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<DrainState>,
}

impl ShutdownCoordinator {
    /// Creates the coordinator plus the shutdown signal receiver the
    /// heartbeat task selects on.
    pub fn new(
        registry: SessionRegistry,
        delivery: DeliveryEngine,
    ) -> (Self, watch::Receiver<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (
            Self {
                registry,
                delivery,
                shutdown_tx,
                heartbeat: Mutex::new(None),
                state: Mutex::new(DrainState::Running),
            },
            shutdown_rx,
        )
    }

    /// Hands the spawned heartbeat task to the coordinator so the drain
    /// can join it.
    pub async fn register_heartbeat(&self, handle: JoinHandle<()>) {
        *self.heartbeat.lock().await = Some(handle);
    }

    pub async fn state(&self) -> DrainState {
        *self.state.lock().await
    }

    /// Runs the drain sequence. Calling it again after completion is a
    /// no-op; per-user failures are logged and never abort the drain for
    /// the remaining sessions.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if *state == DrainState::Stopped {
            return;
        }
        *state = DrainState::Draining;
        info!("Draining: stopping heartbeat and notifying clients");

        // Stop scheduling heartbeat sleeps, then wait the task out.
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.heartbeat.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Heartbeat task join failed: {}", e);
            }
        }

        let mut notice = Message::system(SHUTDOWN_NOTICE, Severity::Warning);
        let report = self.delivery.broadcast(&mut notice, &HashSet::new()).await;
        info!(
            "Shutdown notice delivered to {} client(s), {} failed",
            report.delivered,
            report.failed.len()
        );

        // The broadcast already carried the notice; close and remove every
        // remaining session, even the ones whose close fails.
        for user_id in self.registry.active_users() {
            if let Some(session) = self.registry.session(&user_id) {
                if let Err(e) = session.close().await {
                    error!("Error during shutdown for user {}: {}", user_id, e);
                }
            }
            self.registry.disconnect(&user_id).await;
        }

        *state = DrainState::Stopped;
        info!("Shutdown complete");
    }
}
