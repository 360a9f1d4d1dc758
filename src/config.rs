use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use config::Config;
use rustls_pemfile::{certs, pkcs8_private_keys};
use serde::Deserialize;
use tokio_rustls::{
    rustls::{Certificate, PrivateKey, ServerConfig as RustlsServerConfig},
    TlsAcceptor,
};

use crate::utils::error::ChatError;

/// Which text responder variant the chat ingress is wired to.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponderKind {
    Echo,
}

/// Configuration settings for the chat relay server.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// The port on which the WebSocket listener accepts connections.
    pub port: u16,
    /// The port serving the HTTP API (session queries, metrics, voice).
    pub http_port: u16,
    /// The maximum number of simultaneous connections allowed.
    pub max_connections: usize,
    /// Connection attempts admitted per client address per second.
    pub connection_rate_limit: u32,
    /// Messages a user may receive within the sliding window.
    pub rate_limit_max_messages: usize,
    /// Width of the sliding rate-limit window, in seconds.
    pub rate_limit_window_secs: u64,
    /// Seconds between heartbeat sweeps.
    pub heartbeat_interval_secs: u64,
    /// Seconds of heartbeat silence after which a session is evicted.
    pub heartbeat_timeout_secs: u64,
    /// Text responder wired into the chat ingress.
    pub responder: ResponderKind,
    /// Path to the TLS certificate file.
    pub tls_cert_path: PathBuf,
    /// Path to the TLS private key file.
    pub tls_key_path: PathBuf,
    /// Whether TLS is enabled for secure communication.
    pub enable_tls: bool,
}

impl ServerConfig {
    /// Loads the server configuration from environment variables.
    ///
    /// Environment variables are prefixed with `CHAT_` (e.g. `CHAT_PORT`);
    /// unset values fall back to the defaults below.
    ///
    /// # Errors
    /// Returns a `ChatError::ConfigurationError` if the configuration cannot be loaded.
    pub fn from_env() -> Result<Self, ChatError> {
        Config::builder()
            .set_default("port", 8080)
            .and_then(|b| b.set_default("http_port", 9080))
            .and_then(|b| b.set_default("max_connections", 1024))
            .and_then(|b| b.set_default("connection_rate_limit", 10))
            .and_then(|b| b.set_default("rate_limit_max_messages", 60))
            .and_then(|b| b.set_default("rate_limit_window_secs", 60))
            .and_then(|b| b.set_default("heartbeat_interval_secs", 30))
            .and_then(|b| b.set_default("heartbeat_timeout_secs", 120))
            .and_then(|b| b.set_default("responder", "echo"))
            .and_then(|b| b.set_default("tls_cert_path", "certs/cert.pem"))
            .and_then(|b| b.set_default("tls_key_path", "certs/key.pem"))
            .and_then(|b| b.set_default("enable_tls", false))
            .map_err(|e| ChatError::ConfigurationError(e.to_string()))?
            .add_source(config::Environment::with_prefix("CHAT"))
            .build()
            .map_err(|e| ChatError::ConfigurationError(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ChatError::ConfigurationError(e.to_string()))
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Validates the configuration settings.
    ///
    /// # Errors
    /// Returns a `ChatError::ConfigurationError` if validation fails.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.max_connections == 0 {
            return Err(ChatError::ConfigurationError(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.connection_rate_limit == 0 {
            return Err(ChatError::ConfigurationError(
                "connection_rate_limit must be greater than 0".into(),
            ));
        }

        if self.rate_limit_max_messages == 0 || self.rate_limit_window_secs == 0 {
            return Err(ChatError::ConfigurationError(
                "rate limit window and message count must be greater than 0".into(),
            ));
        }

        if self.heartbeat_interval_secs == 0 || self.heartbeat_timeout_secs == 0 {
            return Err(ChatError::ConfigurationError(
                "heartbeat interval and timeout must be greater than 0".into(),
            ));
        }

        if self.enable_tls {
            if self.max_connections > 10_000 {
                return Err(ChatError::ConfigurationError(
                    "max_connections cannot exceed 10,000".into(),
                ));
            }

            if !self.tls_cert_path.exists() {
                return Err(ChatError::ConfigurationError(format!(
                    "Certificate file not found: {:?}",
                    self.tls_cert_path
                )));
            }

            if !self.tls_key_path.exists() {
                return Err(ChatError::ConfigurationError(format!(
                    "Key file not found: {:?}",
                    self.tls_key_path
                )));
            }
        }

        Ok(())
    }

    /// Creates a TLS acceptor for secure WebSocket connections.
    ///
    /// If TLS is disabled, returns `None`. Otherwise, loads the TLS
    /// certificate and private key and initializes a Rustls TLS acceptor.
    ///
    /// # Errors
    /// Returns a `ChatError::ConfigurationError` if any part of the TLS setup fails.
    pub fn create_tls_acceptor(&self) -> Result<Option<Arc<TlsAcceptor>>, ChatError> {
        if !self.enable_tls {
            return Ok(None);
        }

        let cert_chain = fs::read(&self.tls_cert_path).map_err(|e| {
            ChatError::ConfigurationError(format!(
                "Certificate error: {} (path: {:?})",
                e, self.tls_cert_path
            ))
        })?;

        let key_der = fs::read(&self.tls_key_path).map_err(|e| {
            ChatError::ConfigurationError(format!(
                "Key error: {} (path: {:?})",
                e, self.tls_key_path
            ))
        })?;

        let certs = certs(&mut cert_chain.as_slice())
            .map_err(|e| ChatError::ConfigurationError(format!("Cert parse error: {}", e)))?;

        let mut keys = pkcs8_private_keys(&mut key_der.as_slice())
            .map_err(|e| ChatError::ConfigurationError(format!("Key parse error: {}", e)))?;

        if keys.is_empty() {
            return Err(ChatError::ConfigurationError(format!(
                "No PKCS#8 private key found in {:?}",
                self.tls_key_path
            )));
        }

        let config = RustlsServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(Certificate).collect(),
                PrivateKey(keys.remove(0)),
            )
            .map_err(|e| ChatError::ConfigurationError(format!("TLS config error: {}", e)))?;

        Ok(Some(Arc::new(TlsAcceptor::from(Arc::new(config)))))
    }
}
