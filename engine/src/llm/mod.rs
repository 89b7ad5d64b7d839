//! Reasoning collaborator abstraction
//!
//! The turn orchestrator never talks to an LLM vendor directly. It hands a
//! [`ReasoningRequest`] (message, bounded history, agreed facts and the
//! capability schemas) to a [`ReasoningCollaborator`] and gets back a
//! [`Reasoning`]: reply text, capability requests to dispatch, new facts and
//! whether the conversation is ready for a document.

use crate::capability::CapabilitySchema;
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::{CapabilityCall, ConversationId, Turn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod openai;

pub use openai::OpenAiReasoner;

/// Result type for LLM wire operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Errors that can occur while talking to an LLM API
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl From<LLMError> for EngineError {
    fn from(err: LLMError) -> Self {
        match err {
            LLMError::RateLimitExceeded => EngineError::RateLimited("reasoning".to_string()),
            LLMError::NetworkError(msg) => EngineError::Network(msg),
            LLMError::Timeout(secs) => EngineError::Timeout {
                operation: "reasoning".to_string(),
                secs,
            },
            other => EngineError::Reasoning(other.to_string()),
        }
    }
}

/// Message on the chat-completions wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,

    pub content: String,

    /// Set on tool result messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Set on assistant messages that requested tools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    fn with_role(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, content)
    }

    /// Assistant message that requested `calls`
    pub fn tool_request(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::with_role(MessageRole::Assistant, "")
        }
    }

    pub fn tool_result(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role(MessageRole::Tool, content)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// Function call requested by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,

    pub name: String,

    /// Arguments as the raw JSON string the API returned
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// Everything the collaborator needs to decide the next step of a turn
#[derive(Debug, Clone)]
pub struct ReasoningRequest {
    pub conversation_id: ConversationId,

    /// The stakeholder message that opened this turn
    pub message: String,

    /// Recent history, oldest first; ends with this turn's user message and
    /// any capability records produced so far in the turn
    pub history: Vec<Turn>,

    pub facts: BTreeMap<String, String>,

    pub capabilities: Vec<CapabilitySchema>,
}

/// One reasoning step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reasoning {
    /// Reply for the stakeholder; may be empty while capabilities are pending
    pub text: String,

    /// Non-empty means "dispatch these and ask me again"
    pub capability_requests: Vec<CapabilityCall>,

    /// Decisions to store as agreed facts
    pub facts: BTreeMap<String, String>,

    pub ready_to_emit: bool,

    pub title_hint: Option<String>,
}

impl Reasoning {
    /// A plain reply with nothing else attached
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn wants_capabilities(&self) -> bool {
        !self.capability_requests.is_empty()
    }
}

/// Request for the free-text bodies of a document's sections
#[derive(Debug, Clone)]
pub struct DraftRequest {
    pub conversation_id: ConversationId,
    pub title: String,
    pub history: Vec<Turn>,
    pub facts: BTreeMap<String, String>,
    pub sections: Vec<String>,
}

/// The reasoning collaborator
#[async_trait]
pub trait ReasoningCollaborator: Send + Sync {
    /// Decide the next step of a turn
    async fn reason(&self, request: &ReasoningRequest) -> std::result::Result<Reasoning, EngineError>;

    /// Section name → markdown body. Missing sections are allowed.
    async fn draft_sections(
        &self,
        request: &DraftRequest,
    ) -> std::result::Result<BTreeMap<String, String>, EngineError>;
}
