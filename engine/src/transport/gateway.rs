//! Chat gateway: glue between inbound events, the orchestrator and the
//! outbound transport.

use std::sync::Arc;

use async_trait::async_trait;
use sdk::errors::{BriefErrorExt, EngineError};
use tracing::{error, info, warn};

use super::{ChatTransport, Command, EventHandler, InboundEvent, InboundKind};
use crate::agent::{TurnOrchestrator, TurnOutcome};
use crate::config::Config;
use crate::secrets;
use crate::speech::SpeechCollaborator;

/// Telegram rejects messages longer than this
pub const MAX_MESSAGE_CHARS: usize = 4096;

const TRUNCATION_MARK: &str = "\n\n(truncated)";

const WELCOME: &str = "Hi! I'm Brief, your product manager assistant. Tell me what you need \
and I'll check it against the codebase, ask a few questions and write up a PRD when we're done.";

const HELP: &str = "Commands:\n\
/start - Introduction\n\
/help - This help\n\
/prd [title] - Write the PRD for this conversation now\n\
/reset - Forget the conversation (agreed decisions are kept)\n\
/reset facts - Forget everything, including agreed decisions\n\n\
Send text or a voice note to talk about a feature.";

const UNCLEAR_AUDIO: &str = "Sorry, I couldn't understand the audio. Could you repeat that in text?";

#[derive(Debug, Clone)]
pub struct ReplySettings {
    pub reply_with_voice: bool,
    pub language_hint: Option<String>,
}

impl ReplySettings {
    pub fn from_config(config: &Config) -> Self {
        let language = config.speech.language.trim();
        Self {
            reply_with_voice: config.speech.reply_with_voice,
            language_hint: (!language.is_empty()).then(|| language.to_string()),
        }
    }
}

pub struct ChatGateway {
    orchestrator: Arc<TurnOrchestrator>,
    transport: Arc<dyn ChatTransport>,
    speech: Arc<dyn SpeechCollaborator>,
    settings: ReplySettings,
}

impl ChatGateway {
    pub fn new(
        orchestrator: Arc<TurnOrchestrator>,
        transport: Arc<dyn ChatTransport>,
        speech: Arc<dyn SpeechCollaborator>,
        settings: ReplySettings,
    ) -> Self {
        Self {
            orchestrator,
            transport,
            speech,
            settings,
        }
    }

    async fn process(&self, event: &InboundEvent) -> Result<(), EngineError> {
        let id = &event.conversation_id;
        let to = event.reply_to.as_str();

        match &event.kind {
            InboundKind::Text(text) => {
                let outcome = self.orchestrator.handle_message(id, text).await?;
                self.deliver(to, outcome).await
            }
            InboundKind::Voice { file_ref, file_name } => {
                let text = match self.transcribe(file_ref, file_name).await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(conversation_id = %id, "Voice message not transcribed: {}", e);
                        return self.transport.send_text(to, UNCLEAR_AUDIO).await;
                    }
                };
                info!(conversation_id = %id, chars = text.chars().count(), "Voice message transcribed");
                let outcome = self.orchestrator.handle_message(id, &text).await?;
                self.deliver(to, outcome).await
            }
            InboundKind::Command(command) => self.command(event, command).await,
        }
    }

    async fn command(&self, event: &InboundEvent, command: &Command) -> Result<(), EngineError> {
        let id = &event.conversation_id;
        let to = event.reply_to.as_str();

        match command {
            Command::Start => self.reply(to, WELCOME).await,
            Command::Help => self.transport.send_text(to, HELP).await,
            Command::Reset { facts } => {
                let report = self.orchestrator.reset(id, *facts).await?;
                info!(
                    conversation_id = %id,
                    turns = report.turns_removed,
                    facts = report.facts_removed,
                    "Conversation reset"
                );
                let reply = if *facts {
                    "Done, I've forgotten our conversation and the agreed decisions."
                } else {
                    "Done, I've forgotten our conversation. Agreed decisions are kept."
                };
                self.transport.send_text(to, reply).await
            }
            Command::Document { title } => {
                let outcome = self.orchestrator.generate_document(id, title.as_deref()).await?;
                self.deliver(to, outcome).await
            }
            Command::Unknown(name) => {
                self.transport
                    .send_text(to, &format!("Unknown command /{}. Try /help.", name))
                    .await
            }
        }
    }

    async fn transcribe(&self, file_ref: &str, file_name: &str) -> Result<String, EngineError> {
        let audio = self.transport.download(file_ref).await?;
        self.speech
            .speech_to_text(&audio, file_name, self.settings.language_hint.as_deref())
            .await
    }

    /// Send the document first (if any), then the reply. A failed upload
    /// does not hold back the reply.
    async fn deliver(&self, to: &str, outcome: TurnOutcome) -> Result<(), EngineError> {
        let mut reply = outcome.reply;

        if let Some(emitted) = &outcome.document {
            let file_name = emitted.handle.file_name();
            let caption = format!("PRD: {}", emitted.document.title);
            if let Err(e) = self
                .transport
                .send_document(
                    to,
                    &file_name,
                    emitted.document.body.clone().into_bytes(),
                    Some(&caption),
                )
                .await
            {
                warn!(file = %file_name, "Document upload failed: {}", secrets::scrub(&e.to_string()));
                reply = format!(
                    "{}\n\nSorry, I couldn't attach the document. It was saved as {}.",
                    reply, file_name
                );
            }
        }

        self.reply(to, &reply).await
    }

    /// Voice when enabled, text otherwise or when synthesis fails
    async fn reply(&self, to: &str, text: &str) -> Result<(), EngineError> {
        let text = secrets::scrub(text);

        if self.settings.reply_with_voice {
            match self.speech.text_to_speech(&text).await {
                Ok(audio) => match self.transport.send_voice(to, audio).await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!("Voice reply failed, falling back to text: {}", e),
                },
                Err(e) => warn!("Synthesis failed, falling back to text: {}", e),
            }
        }

        self.transport.send_text(to, &truncate_for_chat(&text)).await
    }
}

#[async_trait]
impl EventHandler for ChatGateway {
    async fn handle(&self, event: InboundEvent) {
        if let Err(e) = self.process(&event).await {
            error!(
                conversation_id = %event.conversation_id,
                "Failed to handle message: {}",
                secrets::scrub(&e.to_string())
            );
            if let Err(send_err) = self.transport.send_text(&event.reply_to, e.user_hint()).await {
                error!("Failed to send error reply: {}", send_err);
            }
        }
    }
}

/// Cut `text` to the chat message limit on a char boundary
pub fn truncate_for_chat(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    let keep = MAX_MESSAGE_CHARS - TRUNCATION_MARK.chars().count();
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARK);
    out
}
