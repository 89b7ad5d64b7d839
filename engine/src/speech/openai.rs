use super::{clean_for_speech, SpeechCollaborator, SpeechError};
use crate::secrets::SecretString;
use async_trait::async_trait;
use sdk::errors::EngineError;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const STT_MODEL: &str = "whisper-1";
const TTS_MODEL: &str = "tts-1";

/// Whisper transcription and TTS over the OpenAI audio endpoints
pub struct OpenAiSpeech {
    base_url: String,
    api_key: SecretString,
    voice: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl OpenAiSpeech {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        voice: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to build speech client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            voice: voice.into(),
            timeout_secs: timeout.as_secs(),
            client,
        })
    }

    fn send_error(&self, operation: &'static str, e: reqwest::Error) -> SpeechError {
        if e.is_timeout() {
            SpeechError::Timeout {
                operation,
                secs: self.timeout_secs,
            }
        } else {
            SpeechError::Network(e.without_url().to_string())
        }
    }
}

fn status_error(status: u16, body: String, fail: fn(String) -> SpeechError) -> SpeechError {
    match status {
        429 => SpeechError::RateLimited,
        s if s >= 500 => SpeechError::Network(format!("server returned {}", s)),
        _ => fail(body),
    }
}

fn mime_for(file_name: &str) -> &'static str {
    match file_name.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("ogg") | Some("oga") | Some("opus") => "audio/ogg",
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("wav") => "audio/wav",
        Some("webm") => "audio/webm",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl SpeechCollaborator for OpenAiSpeech {
    async fn speech_to_text(
        &self,
        audio: &[u8],
        file_name: &str,
        language_hint: Option<&str>,
    ) -> Result<String, EngineError> {
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(file_name.to_string())
            .mime_str(mime_for(file_name))
            .map_err(|e| SpeechError::Stt(format!("Failed to create multipart: {}", e)))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", STT_MODEL)
            .text("response_format", "json");
        if let Some(language) = language_hint.filter(|l| !l.is_empty()) {
            form = form.text("language", language.to_string());
        }

        debug!("Transcribing {} bytes ({})", audio.len(), file_name);

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key.expose()))
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.send_error("transcription", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), body, SpeechError::Stt).into());
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| SpeechError::Stt(format!("invalid response: {}", e)))?;

        let text = data
            .get("text")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if text.is_empty() {
            return Err(SpeechError::Stt("empty transcript".to_string()).into());
        }
        Ok(text.to_string())
    }

    async fn text_to_speech(&self, text: &str) -> Result<Vec<u8>, EngineError> {
        let input = clean_for_speech(text);
        if input.is_empty() {
            return Err(SpeechError::Tts("nothing to say".to_string()).into());
        }

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key.expose()))
            .json(&json!({
                "model": TTS_MODEL,
                "voice": self.voice,
                "input": input,
                "response_format": "opus"
            }))
            .send()
            .await
            .map_err(|e| self.send_error("synthesis", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), body, SpeechError::Tts).into());
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SpeechError::Tts(format!("failed to read audio: {}", e)))?;
        Ok(bytes.to_vec())
    }
}
