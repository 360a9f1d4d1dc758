use async_trait::async_trait;
use serde::Deserialize;

use crate::utils::error::ChatError;

/// Synthesis knobs forwarded to the speech collaborator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoiceOptions {
    pub voice_id: Option<String>,
    pub model_id: Option<String>,
}

/// Transcription knobs forwarded to the speech collaborator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscribeOptions {
    pub language: Option<String>,
}

/// Capability interface for the speech collaborator.
///
/// Only the voice HTTP endpoints call this; the connection core never
/// does. The server runs fine without an implementation wired in, in
/// which case those endpoints answer 503.
#[async_trait]
pub trait SpeechService: Send + Sync {
    /// Maps text to audio bytes.
    async fn synthesize(&self, text: &str, options: &VoiceOptions) -> Result<Vec<u8>, ChatError>;

    /// Maps audio bytes to text.
    async fn transcribe(
        &self,
        audio: &[u8],
        options: &TranscribeOptions,
    ) -> Result<String, ChatError>;
}
