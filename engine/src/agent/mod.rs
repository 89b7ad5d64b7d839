//! Conversation turn handling
//!
//! The orchestrator drives each turn through reasoning, capability dispatch
//! and response; working memory bounds the history it hands to reasoning.

pub mod orchestrator;
pub mod working_memory;

pub use orchestrator::{
    EmittedDocument, OrchestratorSettings, TurnOrchestrator, TurnOutcome, TurnState,
};
pub use working_memory::WorkingMemory;
