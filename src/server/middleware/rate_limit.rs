use governor::{
    clock::QuantaClock,
    middleware::NoOpMiddleware,
    state::keyed::DashMapStateStore,
    Quota, RateLimiter,
};
use std::{
    net::SocketAddr,
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use tokio::time::Instant;

/// Per-user sliding-window admission control for message delivery.
///
/// Each user has an ordered sequence of accept timestamps bounded by a
/// trailing window; entries older than the window are pruned lazily on each
/// check. `is_allowed` never records an attempt - callers check first,
/// perform the send, and call [`Self::record_message`] only on success.
/// System messages bypass both calls entirely.
///
/// State lives in memory only and resets with the process.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    max_messages: usize,
    window: Duration,
    windows: Arc<DashMap<String, Vec<Instant>>>,
}

impl SlidingWindowLimiter {
    /// Creates a limiter allowing `max_messages` per user within the
    /// trailing `window`.
    pub fn new(max_messages: usize, window: Duration) -> Self {
        Self {
            max_messages,
            window,
            windows: Arc::new(DashMap::new()),
        }
    }

    /// Returns whether the user is under the limit. Prunes expired entries
    /// but does not record the attempt.
    pub fn is_allowed(&self, user_id: &str) -> bool {
        let now = Instant::now();
        match self.windows.get_mut(user_id) {
            Some(mut entries) => {
                entries.retain(|t| now.duration_since(*t) < self.window);
                entries.len() < self.max_messages
            }
            None => self.max_messages > 0,
        }
    }

    /// Appends the current timestamp to the user's window. Timestamps have
    /// sub-second resolution, so a same-tick burst still counts each
    /// message individually.
    pub fn record_message(&self, user_id: &str) {
        self.windows
            .entry(user_id.to_string())
            .or_default()
            .push(Instant::now());
    }
}

/// A rate limiter for managing connection attempts per client IP.
#[derive(Clone)]
pub struct ConnectionRateLimiter {
    /// The underlying rate limiter instance, shared across instances.
    limiter: Arc<RateLimiter<SocketAddr, DashMapStateStore<SocketAddr>, QuantaClock, NoOpMiddleware>>,
}

impl ConnectionRateLimiter {
    /// Creates a new `ConnectionRateLimiter` with a specified rate limit.
    ///
    /// # Panics
    ///
    /// This function will panic if `per_second` is zero.
    pub fn new(per_second: u32) -> Self {
        let burst_size = NonZeroU32::new(per_second)
            .expect("Connection rate limit must be greater than 0");

        let quota = Quota::with_period(Duration::from_secs(1))
            .unwrap()
            .allow_burst(burst_size);

        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    /// Checks whether a connection attempt from `addr` is admitted right
    /// now. Rejected attempts are not queued; the caller drops the
    /// connection.
    pub fn check(&self, addr: SocketAddr) -> bool {
        self.limiter.check_key(&addr).is_ok()
    }
}
