use thiserror::Error;

/// Represents various errors that can occur in the chat relay server.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Represents a transport-level failure.
    ///
    /// This error occurs when a WebSocket handshake, send, or close fails.
    /// The affected session is torn down; the error never escalates to
    /// other sessions.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Represents an error in an inbound or outbound message.
    ///
    /// This covers malformed client frames and oversized content. It is
    /// recovered locally and surfaced to the sender as a system error
    /// message while the connection stays open.
    #[error("Message error: {0}")]
    MessageError(#[from] crate::server::message::MessageError),

    /// Indicates a failure in serializing or deserializing data.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Represents an error in the server configuration.
    ///
    /// Configuration errors are fatal at startup; they are the only error
    /// class allowed to stop the process.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Indicates that the text responder collaborator failed.
    ///
    /// Surfaced to the requesting user as an error-severity system message
    /// instead of a chat reply.
    #[error("Responder error: {0}")]
    ResponderError(String),

    /// Indicates that no speech service is wired into the server.
    #[error("Speech service unavailable")]
    SpeechUnavailable,

    /// Indicates that the speech service collaborator failed.
    #[error("Speech service error: {0}")]
    SpeechError(String),
}

/// Implements conversion from `serde_json::Error` to `ChatError`.
impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::SerializationError(err.to_string())
    }
}
