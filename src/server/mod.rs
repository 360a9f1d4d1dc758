// src/server/mod.rs
pub mod delivery;
pub mod handler;
pub mod health;
pub mod heartbeat;
pub mod message;
pub mod middleware;
pub mod session;
pub mod shutdown;

// Re-export public components
pub use delivery::{BroadcastReport, DeliveryEngine, SendOutcome};
pub use handler::handle_connection;
pub use health::HealthMetrics;
pub use heartbeat::HeartbeatMonitor;
pub use message::{ClientFrame, DeliveryStatus, Message, Severity};
pub use middleware::rate_limit::{ConnectionRateLimiter, SlidingWindowLimiter};
pub use session::{Session, SessionRegistry};
pub use shutdown::ShutdownCoordinator;

// Import internal dependencies
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use crate::config::ServerConfig;
use crate::responder::Responder;
use crate::speech::SpeechService;

/// Shared state assembled by the composition root and handed to every
/// connection handler and background task. The registry inside is the
/// single source of truth for who is connected; no module-level singleton
/// exists.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub registry: SessionRegistry,
    pub limiter: SlidingWindowLimiter,
    pub delivery: DeliveryEngine,
    pub metrics: HealthMetrics,
    pub conn_limiter: ConnectionRateLimiter,
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
    pub responder: Arc<dyn Responder>,
    pub speech: Option<Arc<dyn SpeechService>>,
}
