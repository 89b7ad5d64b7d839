//! Telegram Bot API adapter
//!
//! Long-polls `getUpdates`, turns authorized messages into inbound events and
//! implements [`ChatTransport`] over `sendMessage`, `sendVoice`,
//! `sendDocument` and `getFile`. Conversation ids are `telegram:<user id>`;
//! replies go to the originating chat.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use sdk::errors::EngineError;
use sdk::types::ConversationId;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::{ChatTransport, Command, ConversationDispatcher, InboundEvent, InboundKind};
use crate::config::TelegramConfig;
use crate::secrets::SecretString;

const RATE_WINDOW: Duration = Duration::from_secs(3600);
const RATE_PRUNE_THRESHOLD: usize = 128;
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Sliding one-hour window of message timestamps for one user
#[derive(Debug, Default)]
struct HourlyLimit {
    recent: Vec<Instant>,
}

impl HourlyLimit {
    /// Record a message; false once `max` messages fall inside the window
    fn check(&mut self, max: usize, now: Instant) -> bool {
        self.recent.retain(|t| now.duration_since(*t) < RATE_WINDOW);
        if self.recent.len() >= max {
            return false;
        }
        self.recent.push(now);
        true
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.recent.iter().all(|t| now.duration_since(*t) >= RATE_WINDOW)
    }
}

/// Hourly windows for every user seen recently
#[derive(Debug, Default)]
struct RateLimits {
    users: HashMap<i64, HourlyLimit>,
}

impl RateLimits {
    fn check(&mut self, user_id: i64, max: usize, now: Instant) -> bool {
        // users whose window has emptied are dropped so the map stays bounded
        if self.users.len() > RATE_PRUNE_THRESHOLD {
            self.users.retain(|_, limit| !limit.is_idle(now));
        }
        self.users.entry(user_id).or_default().check(max, now)
    }
}

#[derive(Deserialize, Debug)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Deserialize, Debug)]
struct Message {
    chat: Chat,
    from: Option<User>,
    text: Option<String>,
    voice: Option<Voice>,
    audio: Option<Audio>,
}

#[derive(Deserialize, Debug)]
struct Chat {
    id: i64,
}

#[derive(Deserialize, Debug)]
struct User {
    id: i64,
}

#[derive(Deserialize, Debug)]
struct Voice {
    file_id: String,
}

#[derive(Deserialize, Debug)]
struct Audio {
    file_id: String,
    file_name: Option<String>,
}

#[derive(Deserialize, Debug)]
struct File {
    file_path: Option<String>,
}

pub struct TelegramTransport {
    api_base_url: String,
    token: SecretString,
    allowed_users: Vec<i64>,
    poll_timeout_secs: u64,
    max_messages_per_hour: usize,
    client: Client,
    rate_limits: Mutex<RateLimits>,
}

impl std::fmt::Debug for TelegramTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramTransport")
            .field("api_base_url", &self.api_base_url)
            .field("allowed_users", &self.allowed_users)
            .finish()
    }
}

impl TelegramTransport {
    pub fn new(config: &TelegramConfig, token: SecretString) -> Result<Self, EngineError> {
        // must outlive a long poll
        let client = Client::builder()
            .timeout(Duration::from_secs(config.poll_timeout_secs + 30))
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to build Telegram client: {}", e)))?;

        Ok(Self {
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token,
            allowed_users: config.allowed_users.clone(),
            poll_timeout_secs: config.poll_timeout_secs,
            max_messages_per_hour: config.max_messages_per_hour,
            client,
            rate_limits: Mutex::new(RateLimits::default()),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base_url, self.token.expose(), method)
    }

    /// Poll until `shutdown` flips to true. Per-message failures are handled
    /// by the dispatcher's handler; poll failures back off and retry.
    pub async fn run(
        &self,
        dispatcher: &ConversationDispatcher,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("Starting Telegram long-polling loop");
        let mut offset = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let updates = tokio::select! {
                _ = shutdown.changed() => break,
                updates = self.get_updates(offset) => updates,
            };

            match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = update.update_id + 1;
                        if let Some(message) = update.message {
                            if let Some(event) = self.accept(message).await {
                                dispatcher.dispatch(event);
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to fetch Telegram updates: {}", e);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!("Telegram polling stopped");
        Ok(())
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, EngineError> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": self.poll_timeout_secs,
                "allowed_updates": ["message"]
            }),
        )
        .await
    }

    /// Authorize, rate-limit and classify one message. Rejections are
    /// answered here and yield `None`.
    async fn accept(&self, message: Message) -> Option<InboundEvent> {
        let chat_id = message.chat.id.to_string();

        let Some(user_id) = message.from.as_ref().map(|u| u.id) else {
            warn!("Message with no user info, ignoring");
            return None;
        };

        if !self.allowed_users.is_empty() && !self.allowed_users.contains(&user_id) {
            warn!("Unauthorized user {} attempted to use the bot", user_id);
            self.notify(&chat_id, "Unauthorized. Access denied.").await;
            return None;
        }

        let kind = if let Some(text) = message.text {
            match Command::parse(&text) {
                Some(command) => InboundKind::Command(command),
                None => InboundKind::Text(text),
            }
        } else if let Some(voice) = message.voice {
            InboundKind::Voice {
                file_ref: voice.file_id,
                file_name: "voice.ogg".to_string(),
            }
        } else if let Some(audio) = message.audio {
            InboundKind::Voice {
                file_ref: audio.file_id,
                file_name: audio.file_name.unwrap_or_else(|| "audio.mp3".to_string()),
            }
        } else {
            debug!("Unsupported message type from {}", user_id);
            return None;
        };

        // commands are never rate limited
        if !matches!(kind, InboundKind::Command(_)) {
            let allowed = self
                .rate_limits
                .lock()
                .await
                .check(user_id, self.max_messages_per_hour, Instant::now());
            if !allowed {
                warn!("Rate limit exceeded for user {}", user_id);
                let notice = format!(
                    "Rate limit exceeded ({}/hour). Please wait a bit.",
                    self.max_messages_per_hour
                );
                self.notify(&chat_id, &notice).await;
                return None;
            }
        }

        Some(InboundEvent {
            conversation_id: ConversationId::new(format!("telegram:{}", user_id)),
            reply_to: chat_id,
            kind,
        })
    }

    async fn notify(&self, chat_id: &str, text: &str) {
        if let Err(e) = self.send_text(chat_id, text).await {
            error!("Failed to send notice to {}: {}", chat_id, e);
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &serde_json::Value) -> Result<T, EngineError> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| self.send_error(method, e))?;
        self.parse(method, response).await
    }

    async fn call_multipart(&self, method: &str, form: Form) -> Result<(), EngineError> {
        let response = self
            .client
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.send_error(method, e))?;
        self.parse::<serde_json::Value>(method, response).await.map(|_| ())
    }

    async fn parse<T: DeserializeOwned>(&self, method: &str, response: reqwest::Response) -> Result<T, EngineError> {
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(EngineError::RateLimited(format!("telegram {}", method)));
        }

        let body: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| EngineError::Network(format!("telegram {}: invalid response: {}", method, e.without_url())))?;

        match body.result {
            Some(result) if body.ok => Ok(result),
            _ => Err(EngineError::Network(format!(
                "telegram {} failed ({}): {}",
                method,
                status.as_u16(),
                body.description.unwrap_or_else(|| "no description".to_string())
            ))),
        }
    }

    // request urls embed the bot token, so they are stripped from errors
    fn send_error(&self, method: &str, e: reqwest::Error) -> EngineError {
        if e.is_timeout() {
            EngineError::Timeout {
                operation: format!("telegram {}", method),
                secs: self.poll_timeout_secs + 30,
            }
        } else {
            EngineError::Network(format!("telegram {}: {}", method, e.without_url()))
        }
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_text(&self, to: &str, text: &str) -> Result<(), EngineError> {
        self.call::<serde_json::Value>("sendMessage", &json!({ "chat_id": to, "text": text }))
            .await
            .map(|_| ())
    }

    async fn send_voice(&self, to: &str, audio: Vec<u8>) -> Result<(), EngineError> {
        let part = Part::bytes(audio)
            .file_name("reply.ogg")
            .mime_str("audio/ogg")
            .map_err(|e| EngineError::Network(format!("telegram sendVoice: {}", e)))?;
        let form = Form::new().text("chat_id", to.to_string()).part("voice", part);
        self.call_multipart("sendVoice", form).await
    }

    async fn send_document(
        &self,
        to: &str,
        file_name: &str,
        content: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<(), EngineError> {
        let part = Part::bytes(content)
            .file_name(file_name.to_string())
            .mime_str("text/markdown")
            .map_err(|e| EngineError::Network(format!("telegram sendDocument: {}", e)))?;
        let mut form = Form::new().text("chat_id", to.to_string()).part("document", part);
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }
        self.call_multipart("sendDocument", form).await
    }

    async fn download(&self, file_ref: &str) -> Result<Vec<u8>, EngineError> {
        let file: File = self.call("getFile", &json!({ "file_id": file_ref })).await?;
        let file_path = file
            .file_path
            .ok_or_else(|| EngineError::Network("telegram getFile returned no file_path".to_string()))?;

        let url = format!("{}/file/bot{}/{}", self.api_base_url, self.token.expose(), file_path);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.send_error("download", e))?;

        if !response.status().is_success() {
            return Err(EngineError::Network(format!(
                "telegram download failed ({})",
                response.status().as_u16()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::Network(format!("telegram download: {}", e.without_url())))?;
        Ok(bytes.to_vec())
    }
}
