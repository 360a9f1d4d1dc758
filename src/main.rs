//! # chat-relay server binary
//!
//! Composition root for the real-time chat core: builds the registry,
//! rate limiters, delivery engine, heartbeat monitor, and shutdown
//! coordinator, then runs the WebSocket listener and HTTP API until a
//! termination signal arrives.
//!
//! ## Features
//! - Optional TLS accept path using `tokio-rustls`
//! - Per-address connection admission and per-user message rate limiting
//! - Heartbeat-based eviction of dead connections
//! - Drain-based graceful shutdown on SIGINT/SIGTERM
//! - Environment-based configuration loading
//! - Session query + Prometheus metrics HTTP endpoints

use std::sync::Arc;

use tokio::{net::TcpListener, signal};
use tracing::{error, info};

use chat_relay::config::{ResponderKind, ServerConfig};
use chat_relay::responder::{EchoResponder, Responder};
use chat_relay::server::{
    self, handle_connection, ConnectionRateLimiter, DeliveryEngine, HealthMetrics,
    HeartbeatMonitor, ServerState, SessionRegistry, ShutdownCoordinator, SlidingWindowLimiter,
};

/// Entry point for the chat relay server.
///
/// Initializes logging, loads configuration from the environment, wires
/// the shared state, and runs until a shutdown signal drains the server.
///
/// # Errors
/// Returns an error if configuration validation fails or if a listening
/// port cannot be bound; these are the only fatal failures.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env()?;
    config.validate()?;

    let registry = SessionRegistry::new();
    let limiter = SlidingWindowLimiter::new(
        config.rate_limit_max_messages,
        config.rate_limit_window(),
    );
    let metrics = HealthMetrics::new();
    let delivery = DeliveryEngine::new(registry.clone(), limiter.clone(), metrics.clone());
    let responder: Arc<dyn Responder> = match config.responder {
        ResponderKind::Echo => Arc::new(EchoResponder),
    };

    let state = Arc::new(ServerState {
        config: Arc::new(config.clone()),
        registry: registry.clone(),
        limiter,
        delivery: delivery.clone(),
        metrics,
        conn_limiter: ConnectionRateLimiter::new(config.connection_rate_limit),
        tls_acceptor: config.create_tls_acceptor()?,
        responder,
        speech: None,
    });

    let (coordinator, shutdown_rx) = ShutdownCoordinator::new(registry.clone(), delivery);
    let coordinator = Arc::new(coordinator);
    let heartbeat = HeartbeatMonitor::new(
        registry,
        state.delivery.clone(),
        config.heartbeat_interval(),
        config.heartbeat_timeout(),
    );
    coordinator.register_heartbeat(heartbeat.spawn(shutdown_rx)).await;

    // Both listening ports are bound up front; failure here is fatal.
    let listener = TcpListener::bind(format!("0.0.0.0:{}", state.config.port)).await?;
    info!("Server listening on port {}", state.config.port);

    let http_listener =
        std::net::TcpListener::bind(format!("0.0.0.0:{}", state.config.http_port))?;
    http_listener.set_nonblocking(true)?;
    info!("HTTP API listening on port {}", state.config.http_port);
    tokio::spawn({
        let state = state.clone();
        async move {
            if let Err(e) = server::health::serve_http(state, http_listener).await {
                error!("HTTP API server failed: {}", e);
            }
        }
    });

    // Handle incoming connections or shutdown signals
    tokio::select! {
        _ = accept_connections(listener, state.clone()) => {},
        _ = shutdown_signal() => {
            info!("Shutting down gracefully");
        }
    }

    coordinator.shutdown().await;

    Ok(())
}

/// Accepts and handles incoming TCP connections.
///
/// Each connection is served by its own task. A semaphore bounds the
/// number of concurrent connections; when TLS is enabled the stream is
/// upgraded with `tokio-rustls` before the WebSocket handshake.
async fn accept_connections(listener: TcpListener, state: Arc<ServerState>) {
    let semaphore = Arc::new(tokio::sync::Semaphore::new(state.config.max_connections));

    loop {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            // The semaphore is never closed while the loop runs.
            Err(_) => return,
        };

        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let acceptor = state.tls_acceptor.clone();
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                if let Err(e) = handle_connection(tls_stream, state, addr).await {
                                    error!("Connection error: {}", e);
                                }
                            }
                            Err(e) => error!("TLS handshake failed: {}", e),
                        },
                        None => {
                            if let Err(e) = handle_connection(stream, state, addr).await {
                                error!("Connection error: {}", e);
                            }
                        }
                    }
                });
            }
            Err(e) => error!("Accept error: {}", e),
        }
    }
}

/// Resolves when SIGINT (Ctrl+C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to listen for shutdown signal");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
