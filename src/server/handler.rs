use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, instrument};
use tungstenite::handshake::server::{Request, Response};
use tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::server::delivery::RATE_LIMIT_NOTICE;
use crate::server::message::{ClientFrame, Message, Severity};
use crate::server::middleware::validation::validate_frame;
use crate::server::session::{Session, WsTransport};
use crate::server::ServerState;
use crate::utils::error::ChatError;

/// Sender id attached to responder replies when the client did not address
/// a specific agent.
const DEFAULT_AGENT: &str = "assistant";

/// Pulls `user_id` out of a raw query string. No general URL parsing is
/// needed for a single well-known key.
fn user_id_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "user_id")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Handles an incoming WebSocket connection for its entire lifetime.
///
/// Performs the handshake (taking the user id from the `user_id` query
/// parameter, or generating one), admits the session, runs the inbound
/// frame loop, and tears the session down on exit. Transport errors
/// surface in the returned result; the caller only logs them.
#[instrument(skip(stream, state))]
pub async fn handle_connection<S>(
    stream: S,
    state: Arc<ServerState>,
    addr: SocketAddr,
) -> Result<(), ChatError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if !state.conn_limiter.check(addr) {
        debug!("Connection attempt from {} rejected by rate limiter", addr);
        return Ok(());
    }

    let mut query_user = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        query_user = user_id_from_query(req.uri().query());
        Ok(resp)
    })
    .await
    .map_err(|e| {
        error!("WebSocket handshake failed: {}", e);
        ChatError::ConnectionError(e.to_string())
    })?;

    let user_id = query_user.unwrap_or_else(|| Uuid::new_v4().to_string());

    let (writer, mut reader) = ws_stream.split();
    let session = state
        .registry
        .connect(Box::new(WsTransport(writer)), &user_id)
        .await;
    state.metrics.connections.inc();

    let mut welcome = Message::system(
        format!("Welcome! You are connected as {}.", user_id),
        Severity::Info,
    );
    if let Err(e) = state.delivery.send_direct(&mut welcome, &user_id).await {
        error!("Failed to send welcome to {}: {}", user_id, e);
    }

    let mut joined = Message::system(
        format!("User {} has joined the chat.", user_id),
        Severity::Info,
    );
    let exclude: HashSet<String> = [user_id.clone()].into();
    state.delivery.broadcast(&mut joined, &exclude).await;

    let process_result = async {
        while let Some(msg) = reader.next().await {
            let msg = msg.map_err(|e| {
                debug!("Read error for {}: {}", user_id, e);
                ChatError::ConnectionError(e.to_string())
            })?;
            process_message(msg, &session, &user_id, &state).await?;
        }
        Ok(())
    }
    .await;

    let removed = state.registry.disconnect_session(&session).await;
    state.metrics.connections.dec();

    // A replaced session's handler must not announce a departure the user
    // never made.
    if removed {
        let mut left = Message::system(
            format!("User {} has left the chat.", user_id),
            Severity::Info,
        );
        state.delivery.broadcast(&mut left, &HashSet::new()).await;
    }
    info!("Connection closed: {}", user_id);

    process_result
}

/// Processes one inbound WebSocket message.
async fn process_message(
    msg: WsMessage,
    session: &Arc<Session>,
    user_id: &str,
    state: &Arc<ServerState>,
) -> Result<(), ChatError> {
    match msg {
        WsMessage::Text(text) => handle_text(text, session, user_id, state).await,
        WsMessage::Close(_) => Ok(()),
        _ => {
            debug!("Unhandled message type from {}", user_id);
            Ok(())
        }
    }
}

/// Handles one inbound text frame: parse, validate, gate on the sender's
/// window, fan out to the room, and relay the responder's reply.
///
/// Admission errors (malformed JSON, oversized content) are answered with
/// a system error message and keep the connection open; only a failure to
/// reach the sender's own transport escapes to the read loop.
#[instrument(skip(text, session, state))]
async fn handle_text(
    text: String,
    session: &Arc<Session>,
    user_id: &str,
    state: &Arc<ServerState>,
) -> Result<(), ChatError> {
    state.metrics.messages_received.inc();

    let frame = match ClientFrame::parse(&text) {
        Ok(frame) => frame,
        Err(e) => {
            error!("Invalid message format from {}: {}", user_id, e);
            let mut reject = Message::system(
                "Invalid message format. Please send valid JSON.",
                Severity::Error,
            );
            state.delivery.send_direct(&mut reject, user_id).await?;
            return Ok(());
        }
    };

    if let Err(e) = validate_frame(&frame) {
        let mut reject = Message::system(e.to_string(), Severity::Error);
        state.delivery.send_direct(&mut reject, user_id).await?;
        return Ok(());
    }

    session.record_inbound();

    // Ingress gate on the sender's own window: a throttled sender gets
    // exactly one policy notice and the message goes nowhere.
    if !state.limiter.is_allowed(user_id) {
        debug!("Rate limit exceeded for {}", user_id);
        let mut notice = Message::system(RATE_LIMIT_NOTICE, Severity::Error);
        state.delivery.send_direct(&mut notice, user_id).await?;
        return Ok(());
    }

    let mut message = Message::chat(
        user_id,
        frame.content.clone(),
        frame.reply_to.clone(),
        frame.agent_id.clone(),
    );
    let exclude: HashSet<String> = [user_id.to_string()].into();
    state.delivery.broadcast(&mut message, &exclude).await;

    match state.responder.respond(user_id, &frame.content).await {
        Ok(reply) => {
            let agent = frame
                .agent_id
                .clone()
                .unwrap_or_else(|| DEFAULT_AGENT.to_string());
            let mut reply_msg =
                Message::chat(agent.clone(), reply, Some(message.id.clone()), Some(agent));
            state.delivery.send_direct(&mut reply_msg, user_id).await?;
        }
        Err(e) => {
            error!("Responder failed for {}: {}", user_id, e);
            let mut unavailable = Message::system(
                "Assistant is unavailable right now. Please try again.",
                Severity::Error,
            );
            state.delivery.send_direct(&mut unavailable, user_id).await?;
        }
    }

    Ok(())
}
