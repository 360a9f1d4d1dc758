use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{stream::SplitSink, SinkExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use tungstenite::Message as WsMessage;

use crate::utils::error::ChatError;

/// Write half of one client connection, erased so plaintext and TLS
/// sessions live in the same registry and tests can substitute an
/// in-memory transport.
#[async_trait]
pub trait Transport: Send {
    /// Hands one text frame to the transport. Returning `Ok` means the
    /// bytes reached the transport layer, which is what delivery status
    /// reporting is allowed to rely on.
    async fn send_text(&mut self, frame: String) -> Result<(), ChatError>;

    /// Initiates transport close.
    async fn close(&mut self) -> Result<(), ChatError>;
}

/// WebSocket-backed [`Transport`] over any async byte stream.
pub struct WsTransport<S>(pub SplitSink<WebSocketStream<S>, WsMessage>);

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_text(&mut self, frame: String) -> Result<(), ChatError> {
        self.0
            .send(WsMessage::Text(frame))
            .await
            .map_err(|e| ChatError::ConnectionError(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), ChatError> {
        self.0
            .close()
            .await
            .map_err(|e| ChatError::ConnectionError(e.to_string()))
    }
}

/// Activity metadata mutated on every inbound/outbound message and
/// heartbeat tick. Guarded by a plain mutex; the critical sections are
/// in-memory only and never span an await point.
#[derive(Debug, Clone, Copy)]
struct Activity {
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    messages_sent: u64,
    messages_received: u64,
}

/// Serializable snapshot of a session for the HTTP query endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// Server-side record of one connected user: the exclusively-owned
/// transport plus activity metadata.
pub struct Session {
    pub user_id: String,
    /// The transmit path. The async mutex serializes writers, so frames
    /// enqueued for a single recipient keep FIFO order, and the actual
    /// network send happens outside every registry lock.
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    activity: Mutex<Activity>,
    closed: AtomicBool,
}

impl Session {
    fn new(user_id: String, transport: Box<dyn Transport>) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            transport: tokio::sync::Mutex::new(transport),
            activity: Mutex::new(Activity {
                connected_at: now,
                last_activity: now,
                last_heartbeat: now,
                messages_sent: 0,
                messages_received: 0,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Transmits one serialized frame to this client.
    pub async fn send(&self, frame: String) -> Result<(), ChatError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChatError::ConnectionError("session closed".into()));
        }
        let mut transport = self.transport.lock().await;
        transport.send_text(frame).await
    }

    /// Closes the transport. Safe to call from multiple paths; the
    /// underlying close runs exactly once.
    pub async fn close(&self) -> Result<(), ChatError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut transport = self.transport.lock().await;
        transport.close().await
    }

    /// Records an inbound message from this user.
    pub fn record_inbound(&self) {
        let mut activity = self.activity.lock().unwrap();
        activity.messages_sent += 1;
        activity.last_activity = Utc::now();
    }

    /// Records a message delivered to this user.
    pub fn record_outbound(&self) {
        let mut activity = self.activity.lock().unwrap();
        activity.messages_received += 1;
        activity.last_activity = Utc::now();
    }

    /// Refreshes the heartbeat timestamp after a successful probe.
    pub fn touch_heartbeat(&self) {
        self.activity.lock().unwrap().last_heartbeat = Utc::now();
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.activity.lock().unwrap().last_heartbeat
    }

    /// Point-in-time snapshot of the session metadata.
    pub fn info(&self) -> SessionInfo {
        let activity = *self.activity.lock().unwrap();
        SessionInfo {
            user_id: self.user_id.clone(),
            connected_at: activity.connected_at,
            last_activity: activity.last_activity,
            last_heartbeat: activity.last_heartbeat,
            messages_sent: activity.messages_sent,
            messages_received: activity.messages_received,
        }
    }
}

/// The authoritative map from user id to live [`Session`].
///
/// This is the only place sessions are created or removed. Map structure is
/// protected by the shard locks inside `DashMap`; no entry guard is ever
/// held across an await point.
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<Session>>>,
}

impl Clone for SessionRegistry {
    fn clone(&self) -> Self {
        SessionRegistry {
            sessions: Arc::clone(&self.sessions),
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Admits a connection under `user_id` and returns its session.
    ///
    /// At most one session exists per user id: a reconnecting user
    /// replaces the prior session, whose transport is closed first so the
    /// old connection cannot leak.
    pub async fn connect(&self, transport: Box<dyn Transport>, user_id: &str) -> Arc<Session> {
        let session = Arc::new(Session::new(user_id.to_string(), transport));
        let displaced = self.sessions.insert(user_id.to_string(), session.clone());
        if let Some(old) = displaced {
            warn!("Replacing existing session for {}", user_id);
            if let Err(e) = old.close().await {
                debug!("Close of replaced session for {} failed: {}", user_id, e);
            }
        }
        info!("Client connected: {}", user_id);
        session
    }

    /// Removes the user's session, closing its transport best-effort.
    /// Removing a user that is not connected is a no-op.
    pub async fn disconnect(&self, user_id: &str) {
        if let Some((_, session)) = self.sessions.remove(user_id) {
            if let Err(e) = session.close().await {
                debug!("Close during disconnect of {} failed: {}", user_id, e);
            }
            info!("Client disconnected: {}", user_id);
        }
    }

    /// Removes a specific session instance, closing its transport.
    ///
    /// Unlike [`Self::disconnect`] this only removes the map entry when it
    /// still points at `session`; a handler tearing down after its user
    /// reconnected must not evict the replacement. Returns whether the
    /// entry was removed.
    pub async fn disconnect_session(&self, session: &Arc<Session>) -> bool {
        let removed = self
            .sessions
            .remove_if(&session.user_id, |_, current| Arc::ptr_eq(current, session));
        if let Err(e) = session.close().await {
            debug!("Close during disconnect of {} failed: {}", session.user_id, e);
        }
        if removed.is_some() {
            info!("Client disconnected: {}", session.user_id);
            true
        } else {
            false
        }
    }

    /// Snapshot of currently connected user ids. Safe to call concurrently
    /// with connect/disconnect.
    pub fn active_users(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn session(&self, user_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(user_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
impl Session {
    /// Rewinds the heartbeat timestamp so sweeps can observe a stale
    /// session without real waiting.
    pub(crate) fn backdate_heartbeat(&self, by: chrono::Duration) {
        let mut activity = self.activity.lock().unwrap();
        activity.last_heartbeat = Utc::now() - by;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// In-memory transport that records sent frames and can be flipped
    /// into a broken state to simulate a dead connection.
    pub struct RecordingTransport {
        handle: TransportHandle,
    }

    #[derive(Clone, Default)]
    pub struct TransportHandle {
        pub sent: Arc<Mutex<Vec<String>>>,
        pub broken: Arc<AtomicBool>,
        pub closed: Arc<AtomicBool>,
    }

    impl TransportHandle {
        pub fn frames(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        pub fn break_pipe(&self) {
            self.broken.store(true, Ordering::SeqCst);
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    pub fn recording_transport() -> (Box<dyn Transport>, TransportHandle) {
        let handle = TransportHandle::default();
        (
            Box::new(RecordingTransport { handle: handle.clone() }),
            handle,
        )
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_text(&mut self, frame: String) -> Result<(), ChatError> {
            if self.handle.broken.load(Ordering::SeqCst) {
                return Err(ChatError::ConnectionError("broken pipe".into()));
            }
            self.handle.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ChatError> {
            self.handle.closed.store(true, Ordering::SeqCst);
            if self.handle.broken.load(Ordering::SeqCst) {
                return Err(ChatError::ConnectionError("broken pipe".into()));
            }
            Ok(())
        }
    }
}
