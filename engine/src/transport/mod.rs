//! Chat transport layer
//!
//! Adapters turn vendor updates into [`InboundEvent`]s and hand them to the
//! [`ConversationDispatcher`], which keeps one worker per conversation so a
//! conversation's messages are handled strictly in arrival order while
//! different conversations run in parallel.

pub mod gateway;
pub mod telegram;

pub use gateway::{ChatGateway, ReplySettings};
pub use telegram::TelegramTransport;

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::ConversationId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Workers with nothing queued for this long shut down
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// One message from a stakeholder
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub conversation_id: ConversationId,

    /// Transport-specific reply address (a chat id for Telegram)
    pub reply_to: String,

    pub kind: InboundKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundKind {
    Text(String),

    /// Audio that must be downloaded and transcribed first
    Voice { file_ref: String, file_name: String },

    Command(Command),
}

/// Bot commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    /// `/reset` clears history; `/reset facts` clears agreed facts too
    Reset { facts: bool },
    /// `/prd [title]`
    Document { title: Option<String> },
    Unknown(String),
}

impl Command {
    /// Parse a `/command args` line. Returns `None` for plain text.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;

        let (head, args) = match rest.split_once(char::is_whitespace) {
            Some((head, args)) => (head, args.trim()),
            None => (rest, ""),
        };
        // group chats address commands as /cmd@BotName
        let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();

        let command = match name.as_str() {
            "start" => Command::Start,
            "help" => Command::Help,
            "reset" => Command::Reset {
                facts: matches!(args, "facts" | "--facts" | "all"),
            },
            "prd" | "document" => Command::Document {
                title: (!args.is_empty()).then(|| args.to_string()),
            },
            _ => Command::Unknown(head.to_string()),
        };
        Some(command)
    }
}

/// Outbound side of a chat channel
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, to: &str, text: &str) -> Result<(), EngineError>;

    /// Send Ogg/Opus audio as a voice note
    async fn send_voice(&self, to: &str, audio: Vec<u8>) -> Result<(), EngineError>;

    async fn send_document(
        &self,
        to: &str,
        file_name: &str,
        content: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<(), EngineError>;

    /// Fetch an inbound attachment
    async fn download(&self, file_ref: &str) -> Result<Vec<u8>, EngineError>;
}

/// Consumer of inbound events; must not fail, only report
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: InboundEvent);
}

type WorkerMap = Arc<Mutex<HashMap<ConversationId, mpsc::UnboundedSender<InboundEvent>>>>;

/// Routes events to one sequential worker per conversation
pub struct ConversationDispatcher {
    handler: Arc<dyn EventHandler>,
    workers: WorkerMap,
    in_flight: Arc<AtomicUsize>,
    idle_timeout: Duration,
}

impl ConversationDispatcher {
    pub fn new(handler: Arc<dyn EventHandler>) -> Self {
        Self::with_idle_timeout(handler, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(handler: Arc<dyn EventHandler>, idle_timeout: Duration) -> Self {
        Self {
            handler,
            workers: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle_timeout,
        }
    }

    /// Queue `event` behind earlier events of the same conversation
    pub fn dispatch(&self, event: InboundEvent) {
        let mut workers = match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // counted from enqueue until the handler returns
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let event = match workers.get(&event.conversation_id) {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                // worker died; start a fresh one below
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let id = event.conversation_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(event).is_err() {
            warn!(conversation_id = %id, "Dropped event for closed worker");
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        workers.insert(id.clone(), tx);

        debug!(conversation_id = %id, "Starting conversation worker");
        tokio::spawn(run_worker(
            id,
            rx,
            Arc::clone(&self.handler),
            Arc::clone(&self.workers),
            Arc::clone(&self.in_flight),
            self.idle_timeout,
        ));
    }

    /// Conversations with a live worker
    pub fn active_conversations(&self) -> usize {
        match self.workers.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Events queued or being handled
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every dispatched event has been handled, at most `limit`.
    /// Returns false if work was still running when the limit expired.
    pub async fn drain(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while self.in_flight() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

async fn run_worker(
    id: ConversationId,
    mut rx: mpsc::UnboundedReceiver<InboundEvent>,
    handler: Arc<dyn EventHandler>,
    workers: WorkerMap,
    in_flight: Arc<AtomicUsize>,
    idle_timeout: Duration,
) {
    loop {
        let event = match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => {
                // Senders only push while holding the map lock, so an empty
                // queue checked under it stays empty once we deregister.
                let mut map = match workers.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                match rx.try_recv() {
                    Ok(event) => event,
                    Err(_) => {
                        map.remove(&id);
                        debug!(conversation_id = %id, "Conversation worker idle, stopping");
                        break;
                    }
                }
            }
        };

        handler.handle(event).await;
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
