//! Conversation and capability types shared across Brief components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque, stable identifier of one conversation.
///
/// Transport adapters decide how to build it (e.g. `telegram:<user id>`);
/// the core never inspects its shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Create a conversation id from any string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Who produced a turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// Message from the stakeholder
    User,

    /// Reply sent back to the stakeholder
    Assistant,

    /// A dispatched capability request and its outcome
    Capability,

    /// Failure record for a turn (timeouts, reasoning errors)
    Audit,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::Capability => "capability",
            TurnRole::Audit => "audit",
        }
    }

    /// Parse the stored representation back into a role
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(TurnRole::User),
            "assistant" => Some(TurnRole::Assistant),
            "capability" => Some(TurnRole::Capability),
            "audit" => Some(TurnRole::Audit),
            _ => None,
        }
    }
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a conversation's history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Durable per-conversation state: ordered history plus agreed facts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationSession {
    pub id: ConversationId,
    pub turns: Vec<Turn>,
    pub facts: BTreeMap<String, String>,
}

impl ConversationSession {
    /// An empty session for a conversation that has not spoken yet
    pub fn empty(id: ConversationId) -> Self {
        Self {
            id,
            turns: Vec::new(),
            facts: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty() && self.facts.is_empty()
    }

    /// Turns exchanged with the stakeholder, skipping capability and audit records
    pub fn dialogue(&self) -> impl Iterator<Item = &Turn> {
        self.turns
            .iter()
            .filter(|t| matches!(t.role, TurnRole::User | TurnRole::Assistant))
    }
}

/// A capability invocation requested by the reasoning collaborator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityCall {
    /// Collaborator-assigned id used to correlate the result
    pub id: String,

    /// Registered capability name
    pub name: String,

    /// Arguments, validated against the capability schema before dispatch
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

impl CapabilityCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Recorded result of one dispatched capability call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CapabilityOutcome {
    Success { value: serde_json::Value },
    Failure { error: String },
}

impl CapabilityOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CapabilityOutcome::Success { .. })
    }
}

/// Audit record stored as the content of a `capability` turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityRecord {
    pub call: CapabilityCall,
    pub outcome: CapabilityOutcome,
}
