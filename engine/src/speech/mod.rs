//! Speech collaborator: voice notes in, synthesized replies out.

pub mod openai;

pub use openai::OpenAiSpeech;

use async_trait::async_trait;
use sdk::errors::EngineError;
use thiserror::Error;

/// Longest text sent to synthesis, in characters
pub const MAX_SPEECH_CHARS: usize = 4000;

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("transcription failed: {0}")]
    Stt(String),

    #[error("synthesis failed: {0}")]
    Tts(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited")]
    RateLimited,

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },
}

impl From<SpeechError> for EngineError {
    fn from(err: SpeechError) -> Self {
        match err {
            SpeechError::Stt(msg) => EngineError::Transcription(msg),
            SpeechError::Tts(msg) => EngineError::Synthesis(msg),
            SpeechError::Network(msg) => EngineError::Network(msg),
            SpeechError::RateLimited => EngineError::RateLimited("speech".to_string()),
            SpeechError::Timeout { operation, secs } => EngineError::Timeout {
                operation: operation.to_string(),
                secs,
            },
        }
    }
}

#[async_trait]
pub trait SpeechCollaborator: Send + Sync {
    /// Transcribe an audio clip. `file_name` carries the container format.
    async fn speech_to_text(
        &self,
        audio: &[u8],
        file_name: &str,
        language_hint: Option<&str>,
    ) -> Result<String, EngineError>;

    /// Synthesize `text`; returns Ogg/Opus audio
    async fn text_to_speech(&self, text: &str) -> Result<Vec<u8>, EngineError>;
}

/// Strip markdown emphasis and heading markers and cap the length, so the
/// voice does not read symbols aloud.
pub fn clean_for_speech(text: &str) -> String {
    let cleaned = text
        .replace("**", "")
        .replace("__", "")
        .replace('`', "")
        .lines()
        .map(|line| line.trim_start_matches('#').trim_start())
        .collect::<Vec<_>>()
        .join("\n");

    cleaned.trim().chars().take(MAX_SPEECH_CHARS).collect()
}
