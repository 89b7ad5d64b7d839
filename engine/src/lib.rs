//! Brief Engine Library
//!
//! Core of the Brief requirements-intake bot: durable conversation state,
//! the turn orchestrator, capability registry, document emitter and the
//! collaborator adapters. Used by the `brief` binary and integration tests.

/// Configuration management module
pub mod config;

/// Secret management module
pub mod secrets;

/// Per-key async locks
pub mod locks;

/// Database persistence module
pub mod db;

/// Capability registry and code-search capabilities
pub mod capability;

/// Reasoning collaborator abstraction
pub mod llm;

/// Turn orchestration
pub mod agent;

/// PRD rendering and persistence
pub mod document;

/// Speech-to-text and text-to-speech
pub mod speech;

/// Chat transports and per-conversation dispatch
pub mod transport;

/// Application wiring and lifecycle
pub mod app;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
