//! Error types and handling
//!
//! This module provides the error taxonomy shared by the Brief engine and its
//! collaborator adapters. Every error implements the `BriefErrorExt` trait,
//! which supplies a short user-facing hint and tells the orchestrator whether
//! the failure is worth a single retry.
//!
//! # Security
//!
//! User hints are static strings. They never include:
//! - Secrets (API keys, tokens)
//! - File paths or raw vendor responses
//! - Stack traces

use std::path::PathBuf;
use thiserror::Error;

/// Trait for Brief error extensions
///
/// Provides a user-safe hint for each error and classifies whether the
/// failure is transient (eligible for one retry) or permanent.
pub trait BriefErrorExt {
    /// Returns a short apologetic message safe to show to the chat user
    fn user_hint(&self) -> &str;

    /// Returns whether retrying the same external call may succeed
    fn is_transient(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Configuration**: missing credentials or invalid config (fatal at startup)
/// - **Storage**: session or document persistence failures (turn aborted)
/// - **Capability**: unknown capability, invalid arguments, handler failures
/// - **Timeout**: an external call exceeded its budget
/// - **Speech**: transcription or synthesis failures
/// - **Reasoning**: the reasoning collaborator failed or answered nonsense
///
/// # Examples
///
/// ```
/// use sdk::errors::{BriefErrorExt, EngineError};
///
/// let error = EngineError::UnknownCapability("fly_to_moon".to_string());
/// assert!(!error.is_transient());
///
/// let timeout = EngineError::Timeout { operation: "search_code".to_string(), secs: 30 };
/// assert!(timeout.is_transient());
/// println!("Hint: {}", timeout.user_hint());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Missing required configuration: {}", missing.join(", "))]
    Configuration { missing: Vec<String> },

    #[error("Configuration error: {0}")]
    Config(String),

    // Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Document already exists, refusing to overwrite: {0:?}")]
    DocumentCollision(PathBuf),

    // Capability errors
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Invalid arguments for capability '{capability}': {reason}")]
    InvalidArguments { capability: String, reason: String },

    #[error("Capability '{capability}' failed: {message}")]
    CapabilityExecution { capability: String, message: String },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    // Collaborator errors
    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("Speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("Reasoning failed: {0}")]
    Reasoning(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Shorthand for a storage failure built from any displayable error
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Shorthand for a capability handler failure
    pub fn capability(capability: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::CapabilityExecution {
            capability: capability.into(),
            message: message.to_string(),
        }
    }
}

impl BriefErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Configuration { .. } | Self::Config(_) => {
                "Sorry, I'm not configured properly yet. Please contact the administrator."
            }

            Self::Storage(_) | Self::Io(_) => {
                "Sorry, I couldn't save our conversation just now. Please try again in a moment."
            }
            Self::DocumentCollision(_) => {
                "Sorry, I couldn't save the document. Please ask me to generate it again."
            }

            Self::UnknownCapability(_) | Self::InvalidArguments { .. } => {
                "Sorry, something went wrong while I was looking into that. Could you rephrase?"
            }
            Self::CapabilityExecution { .. } => {
                "Sorry, I couldn't reach the code repository. Let's continue without it for now."
            }
            Self::Timeout { .. } => "Sorry, that took too long. Could you try again?",

            Self::Transcription(_) => {
                "Sorry, I couldn't understand the audio. Could you repeat that in text?"
            }
            Self::Synthesis(_) => "Sorry, I couldn't record a voice reply.",
            Self::Reasoning(_) => "Sorry, I had trouble processing that. Could you try again?",

            Self::Network(_) => "Sorry, I'm having network trouble. Please try again shortly.",
            Self::RateLimited(_) => "Sorry, I'm a bit overloaded. Please wait a moment.",
        }
    }

    fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Network(_) | Self::RateLimited(_)
        )
    }
}
