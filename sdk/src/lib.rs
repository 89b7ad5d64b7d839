//! Brief SDK
//!
//! Shared library providing the error taxonomy and conversation types used by
//! the Brief engine and its collaborator adapters.

/// Error types and handling
pub mod errors;

/// Conversation, turn and capability types
pub mod types;

// Re-export commonly used types
pub use errors::{BriefErrorExt, EngineError};
pub use types::{
    CapabilityCall, CapabilityOutcome, CapabilityRecord, ConversationId, ConversationSession,
    Turn, TurnRole,
};
