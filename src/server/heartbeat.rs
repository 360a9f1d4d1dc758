use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::server::delivery::DeliveryEngine;
use crate::server::message::{Message, Severity};
use crate::server::session::SessionRegistry;
use crate::utils::error::ChatError;

/// Content of the periodic liveness probe.
pub const HEARTBEAT_CONTENT: &str = "heartbeat";

/// Pause before resuming the loop after an unexpected sweep failure.
const SWEEP_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Background task that periodically probes every session and evicts the
/// unresponsive ones.
///
/// Each sweep sends a debug-severity system message (which bypasses rate
/// limiting by type) to every live session and disconnects sessions whose
/// last successful probe is older than the timeout. Per-user errors are
/// absorbed by the sweep; they never terminate the loop.
pub struct HeartbeatMonitor {
    registry: SessionRegistry,
    delivery: DeliveryEngine,
    period: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: SessionRegistry,
        delivery: DeliveryEngine,
        period: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            delivery,
            period,
            timeout,
        }
    }

    /// Spawns the monitor loop. The task observes `shutdown` and exits
    /// within one period of the flag flipping.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // tokio intervals fire immediately; the first sweep should
            // wait a full period like every other one.
            ticker.tick().await;

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        // A dead channel means the coordinator is gone;
                        // stop either way.
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        if let Err(e) = self.sweep().await {
                            error!("Heartbeat sweep failed: {}", e);
                            tokio::select! {
                                changed = shutdown.changed() => {
                                    if changed.is_err() || *shutdown.borrow() {
                                        break;
                                    }
                                }
                                _ = tokio::time::sleep(SWEEP_ERROR_BACKOFF) => {}
                            }
                        }
                    }
                }
            }
            debug!("Heartbeat monitor stopped");
        })
    }

    /// One pass over the registry: evict sessions whose last heartbeat is
    /// older than the timeout, probe the rest.
    ///
    /// Transport failures mark the session for eviction and the sweep
    /// continues; anything else is unexpected and bubbles up so the loop
    /// can back off.
    pub async fn sweep(&self) -> Result<(), ChatError> {
        let now = Utc::now();
        let mut evict = Vec::new();

        for user_id in self.registry.active_users() {
            let Some(session) = self.registry.session(&user_id) else {
                continue;
            };

            let silence = (now - session.last_heartbeat()).to_std().unwrap_or_default();
            if silence > self.timeout {
                info!("Heartbeat timeout for {}", user_id);
                evict.push(user_id);
                continue;
            }

            let mut probe = Message::system(HEARTBEAT_CONTENT, Severity::Debug);
            match self.delivery.send_direct(&mut probe, &user_id).await {
                Ok(_) => session.touch_heartbeat(),
                Err(ChatError::ConnectionError(e)) => {
                    debug!("Heartbeat probe to {} failed: {}", user_id, e);
                    evict.push(user_id);
                }
                Err(e) => return Err(e),
            }
        }

        for user_id in &evict {
            self.registry.disconnect(user_id).await;
        }
        if !evict.is_empty() {
            info!("Evicted {} stale session(s)", evict.len());
        }
        Ok(())
    }
}
