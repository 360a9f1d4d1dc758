use async_trait::async_trait;

use crate::utils::error::ChatError;

/// Capability interface for the text responder collaborator.
///
/// The chat-ingress path invokes this after an inbound message clears rate
/// limiting; the reply re-enters the delivery engine as a chat message to
/// the requesting user. A failure is surfaced to that user as an
/// error-severity system message instead of a reply.
///
/// Variants are selected by configuration, not subclassing; the AI side of
/// the service plugs in here without the core knowing about it.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, user_id: &str, content: &str) -> Result<String, ChatError>;
}

/// Built-in responder that echoes the inbound content back.
///
/// Useful as the default wiring and for driving the delivery path in
/// integration tests without an external model.
pub struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(&self, user_id: &str, content: &str) -> Result<String, ChatError> {
        Ok(format!("{}: {}", user_id, content))
    }
}
