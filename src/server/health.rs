use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::server::ServerState;
use crate::speech::{TranscribeOptions, VoiceOptions};
use crate::utils::error::ChatError;

/// Struct for managing server health metrics, including active connections and message counts.
#[derive(Clone)]
pub struct HealthMetrics {
    /// Tracks the number of active WebSocket connections.
    pub connections: IntGauge,
    /// Counts the total number of messages received by the server.
    pub messages_received: IntCounter,
    /// Counts the total number of messages sent by the server.
    pub messages_sent: IntCounter,
    /// Prometheus registry used to store and manage the metrics.
    registry: Registry,
}

impl HealthMetrics {
    /// Creates a new instance of `HealthMetrics` and registers the metrics with Prometheus.
    pub fn new() -> Self {
        let registry = Registry::new();
        let connections = IntGauge::new("connections", "Active connections").unwrap();
        let messages_received = IntCounter::new("messages_received", "Total messages received").unwrap();
        let messages_sent = IntCounter::new("messages_sent", "Total messages sent").unwrap();

        registry.register(Box::new(connections.clone())).unwrap();
        registry.register(Box::new(messages_received.clone())).unwrap();
        registry.register(Box::new(messages_sent.clone())).unwrap();

        Self {
            connections,
            messages_received,
            messages_sent,
            registry,
        }
    }

    /// Exposes the current state of all registered metrics in Prometheus-compatible format.
    pub fn expose_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the HTTP API router: Prometheus metrics, session queries, and
/// the voice endpoints.
pub fn api_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/chat/active-users", get(active_users_handler))
        .route("/chat/user-session/:user_id", get(user_session_handler))
        .route("/voice/synthesize", post(synthesize_handler))
        .route("/voice/transcribe", post(transcribe_handler))
        .with_state(state)
}

/// Serves the HTTP API on an already-bound listener. Binding happens in
/// the composition root so an unavailable port is a startup failure.
pub async fn serve_http(
    state: Arc<ServerState>,
    listener: std::net::TcpListener,
) -> Result<(), ChatError> {
    let app = api_router(state);
    axum::Server::from_tcp(listener)
        .map_err(|e| ChatError::ConnectionError(e.to_string()))?
        .serve(app.into_make_service())
        .await
        .map_err(|e| ChatError::ConnectionError(e.to_string()))
}

/// Handles the `/metrics` HTTP request and returns the current metrics data.
async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    state.metrics.expose_metrics()
}

/// Lists the currently connected user ids.
async fn active_users_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(json!({ "active_users": state.registry.active_users() }))
}

/// Fetches one user's session metadata, or 404 when the user is not
/// connected.
async fn user_session_handler(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
) -> Response {
    match state.registry.session(&user_id) {
        Some(session) => Json(session.info()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "User session not found" })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SynthesizeRequest {
    text: String,
    #[serde(flatten)]
    options: VoiceOptions,
}

/// Converts text to speech through the configured speech collaborator.
async fn synthesize_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<SynthesizeRequest>,
) -> Response {
    let Some(speech) = &state.speech else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    match speech.synthesize(&request.text, &request.options).await {
        Ok(audio) => ([(header::CONTENT_TYPE, "audio/mpeg")], audio).into_response(),
        Err(e) => {
            error!("Speech synthesis failed: {}", e);
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// Transcribes an audio payload through the configured speech collaborator.
async fn transcribe_handler(State(state): State<Arc<ServerState>>, audio: Bytes) -> Response {
    let Some(speech) = &state.speech else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    match speech.transcribe(&audio, &TranscribeOptions::default()).await {
        Ok(text) => Json(json!({ "text": text })).into_response(),
        Err(e) => {
            error!("Transcription failed: {}", e);
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
