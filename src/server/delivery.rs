use std::collections::HashSet;

use tracing::{debug, error, instrument};

use crate::server::health::HealthMetrics;
use crate::server::message::{Message, Severity};
use crate::server::middleware::rate_limit::SlidingWindowLimiter;
use crate::server::session::SessionRegistry;
use crate::utils::error::ChatError;

/// Policy notice transmitted in place of a message that tripped the
/// sliding window.
pub const RATE_LIMIT_NOTICE: &str =
    "Rate limit exceeded. Please wait before sending more messages.";

/// What became of a direct send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Bytes were handed to the recipient's transport.
    Delivered,
    /// Recipient has no active session; the message was silently dropped
    /// and its status left pending.
    NoSession,
    /// The recipient's window was full; a policy notice was sent instead
    /// and the original dropped with status pending.
    RateLimited,
}

/// Per-recipient results of a broadcast sweep.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<String>,
}

/// Performs direct and broadcast message transmission with rate-limit and
/// delivery-status bookkeeping.
#[derive(Clone)]
pub struct DeliveryEngine {
    registry: SessionRegistry,
    limiter: SlidingWindowLimiter,
    metrics: HealthMetrics,
}

impl DeliveryEngine {
    pub fn new(
        registry: SessionRegistry,
        limiter: SlidingWindowLimiter,
        metrics: HealthMetrics,
    ) -> Self {
        Self {
            registry,
            limiter,
            metrics,
        }
    }

    /// Sends one message to one user.
    ///
    /// A missing session is a silent no-op, not an error - the message
    /// status simply stays pending. Non-system messages are gated by the
    /// recipient's sliding window; system messages bypass it by type tag.
    /// A transport failure marks the message failed and propagates to the
    /// caller, who decides whether to disconnect the session.
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    pub async fn send_direct(
        &self,
        message: &mut Message,
        user_id: &str,
    ) -> Result<SendOutcome, ChatError> {
        let Some(session) = self.registry.session(user_id) else {
            debug!("No active session for {}, dropping message", user_id);
            return Ok(SendOutcome::NoSession);
        };

        if !message.is_system() && !self.limiter.is_allowed(user_id) {
            debug!("Rate limit exceeded for {}", user_id);
            let notice = Message::system(RATE_LIMIT_NOTICE, Severity::Error);
            session.send(notice.to_frame()?).await?;
            return Ok(SendOutcome::RateLimited);
        }

        let frame = message.to_frame()?;
        match session.send(frame).await {
            Ok(()) => {
                message.mark_delivered();
                session.record_outbound();
                self.metrics.messages_sent.inc();
                if !message.is_system() {
                    self.limiter.record_message(user_id);
                }
                Ok(SendOutcome::Delivered)
            }
            Err(e) => {
                error!("Error sending message to {}: {}", user_id, e);
                message.mark_failed();
                Err(e)
            }
        }
    }

    /// Sends the message to every active user not in `exclude`.
    ///
    /// Each recipient is independent: a failing transport is logged and
    /// that session evicted, but delivery to the remaining recipients
    /// continues. Cross-recipient ordering is unspecified.
    #[instrument(skip(self, message, exclude), fields(message_id = %message.id))]
    pub async fn broadcast(
        &self,
        message: &mut Message,
        exclude: &HashSet<String>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for user_id in self.registry.active_users() {
            if exclude.contains(&user_id) {
                continue;
            }
            match self.send_direct(message, &user_id).await {
                Ok(SendOutcome::Delivered) => report.delivered += 1,
                Ok(_) => {}
                Err(e) => {
                    error!("Broadcast to {} failed: {}", user_id, e);
                    self.registry.disconnect(&user_id).await;
                    report.failed.push(user_id);
                }
            }
        }
        report
    }
}
