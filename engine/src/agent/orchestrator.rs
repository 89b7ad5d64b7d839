//! Turn Orchestrator
//!
//! Runs one conversational turn end to end:
//!
//! 1. Record the stakeholder message (`Received`)
//! 2. Ask the reasoning collaborator for the next step (`Reasoning`)
//! 3. Dispatch requested capabilities in order and record each outcome
//!    (`CapabilityPending`), then reason again
//! 4. Store agreed facts, emit a document if the collaborator says the
//!    conversation is ready, record the reply (`Responding`)
//! 5. `Completed`
//!
//! # Limits
//!
//! - At most `max_iterations` reasoning rounds per turn; past that the
//!   stakeholder gets a "could not complete" reply
//! - Every reasoning and capability call has its own timeout
//! - Transient failures (timeout, network, rate limit) are retried once
//!
//! Reasoning and capability failures never escape a turn: they are written
//! to the audit trail and the stakeholder gets an apologetic reply.
//!
//! Nothing is stored while a turn runs. Its turns and facts are committed
//! in one transaction when it completes, so a storage failure aborts the
//! turn and leaves the session exactly as it was.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sdk::errors::{BriefErrorExt, EngineError};
use sdk::types::{
    CapabilityCall, CapabilityOutcome, CapabilityRecord, ConversationId, ConversationSession, Turn,
    TurnRole,
};
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::WorkingMemory;
use crate::capability::CapabilityRegistry;
use crate::config::Config;
use crate::db::{ResetReport, SessionStore};
use crate::document::{DocumentEmitter, DocumentHandle, GeneratedDocument};
use crate::llm::{Reasoning, ReasoningCollaborator, ReasoningRequest};
use crate::secrets;

/// Reply when the iteration cap is hit
pub const INCOMPLETE_REPLY: &str =
    "Sorry, I could not complete that request. Could you rephrase it or narrow it down?";

const EMPTY_SESSION_REPLY: &str =
    "There is nothing to document yet. Tell me about the feature you have in mind first.";

/// Phase of a turn, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Received,
    Reasoning,
    CapabilityPending,
    Responding,
    Completed,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnState::Received => "received",
            TurnState::Reasoning => "reasoning",
            TurnState::CapabilityPending => "capability_pending",
            TurnState::Responding => "responding",
            TurnState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Limits applied to every turn
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_iterations: usize,
    pub reasoning_timeout: Duration,
    pub capability_timeout: Duration,
    pub retry_delay: Duration,
    pub max_history_tokens: usize,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_iterations: config.orchestrator.max_iterations,
            reasoning_timeout: Duration::from_secs(config.llm.reasoning_timeout_secs),
            capability_timeout: Duration::from_secs(config.orchestrator.capability_timeout_secs),
            retry_delay: Duration::from_millis(config.orchestrator.retry_delay_ms),
            max_history_tokens: config.llm.max_history_tokens,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            reasoning_timeout: Duration::from_secs(120),
            capability_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_millis(500),
            max_history_tokens: 8000,
        }
    }
}

/// A document produced during a turn
#[derive(Debug, Clone)]
pub struct EmittedDocument {
    pub document: GeneratedDocument,
    pub handle: DocumentHandle,
}

/// What the transport should send back
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    pub document: Option<EmittedDocument>,
    /// The reply is an apology rather than a real answer
    pub degraded: bool,
    pub iterations: usize,
}

pub struct TurnOrchestrator {
    store: Arc<dyn SessionStore>,
    registry: Arc<CapabilityRegistry>,
    reasoner: Arc<dyn ReasoningCollaborator>,
    emitter: Arc<DocumentEmitter>,
    settings: OrchestratorSettings,
    locks: crate::locks::KeyedLocks,
}

impl TurnOrchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<CapabilityRegistry>,
        reasoner: Arc<dyn ReasoningCollaborator>,
        emitter: Arc<DocumentEmitter>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            registry,
            reasoner,
            emitter,
            settings,
            locks: crate::locks::KeyedLocks::new(),
        }
    }

    /// Run one turn for `id`. Turns for the same id are serialized; other
    /// ids proceed in parallel.
    pub async fn handle_message(&self, id: &ConversationId, text: &str) -> Result<TurnOutcome, EngineError> {
        let _guard = self.locks.lock(id.as_str()).await;
        let span = tracing::info_span!("turn", conversation_id = %id);
        self.run_turn(id, text).instrument(span).await
    }

    /// Emit a document on demand, outside the reasoning loop
    pub async fn generate_document(
        &self,
        id: &ConversationId,
        title_hint: Option<&str>,
    ) -> Result<TurnOutcome, EngineError> {
        let _guard = self.locks.lock(id.as_str()).await;
        let span = tracing::info_span!("document", conversation_id = %id);

        async {
            let session = self.store.load(id).await?;
            if session.dialogue().next().is_none() {
                return Ok(TurnOutcome {
                    reply: EMPTY_SESSION_REPLY.to_string(),
                    document: None,
                    degraded: false,
                    iterations: 0,
                });
            }

            let document = self.emitter.emit(&session, title_hint).await;
            let handle = self.emitter.persist(&document).await?;
            let emitted = EmittedDocument { document, handle };
            let reply = format!("Here is the PRD for \"{}\".", emitted.document.title);
            if let Err(e) = self.store.append_turn(id, TurnRole::Assistant, &reply).await {
                self.discard(&emitted).await;
                return Err(e);
            }

            Ok(TurnOutcome {
                reply,
                document: Some(emitted),
                degraded: false,
                iterations: 0,
            })
        }
        .instrument(span)
        .await
    }

    /// Explicit reset of a conversation's history (and facts when asked)
    pub async fn reset(&self, id: &ConversationId, include_facts: bool) -> Result<ResetReport, EngineError> {
        let _guard = self.locks.lock(id.as_str()).await;
        self.store.reset(id, include_facts).await
    }

    fn transition(&self, state: TurnState) {
        debug!(state = %state, "Turn state");
    }

    async fn run_turn(&self, id: &ConversationId, text: &str) -> Result<TurnOutcome, EngineError> {
        self.transition(TurnState::Received);
        let mut draft = TurnDraft::new(self.store.load(id).await?);
        draft.push(TurnRole::User, text);

        let mut iterations = 0;
        let mut ready_to_emit = false;
        let mut title_hint: Option<String> = None;

        let (mut reply, degraded) = loop {
            if iterations >= self.settings.max_iterations {
                warn!("Iteration cap of {} reached", self.settings.max_iterations);
                draft.audit(&format!("iteration limit reached after {} rounds", iterations));
                break (INCOMPLETE_REPLY.to_string(), true);
            }
            iterations += 1;

            self.transition(TurnState::Reasoning);
            let reasoning = match self.reason(&draft.session, text).await {
                Ok(reasoning) => reasoning,
                Err(e) => {
                    warn!("Reasoning failed: {}", secrets::scrub(&e.to_string()));
                    draft.audit(&format!("reasoning failed: {}", e));
                    break (e.user_hint().to_string(), true);
                }
            };

            for (key, value) in &reasoning.facts {
                draft.set_fact(key, value);
            }
            ready_to_emit |= reasoning.ready_to_emit;
            if reasoning.title_hint.is_some() {
                title_hint = reasoning.title_hint.clone();
            }

            if !reasoning.wants_capabilities() {
                break (reasoning.text, false);
            }

            self.transition(TurnState::CapabilityPending);
            for call in reasoning.capability_requests {
                self.dispatch(&mut draft, call).await?;
            }
        };

        self.transition(TurnState::Responding);
        let mut document = None;

        if ready_to_emit && !degraded {
            match self.emit(&draft.session, title_hint.as_deref()).await {
                Ok(emitted) => document = Some(emitted),
                Err(e) => {
                    warn!("Document emission failed: {}", e);
                    draft.audit(&format!("document emission failed: {}", e));
                    reply = format!("{}\n\n{}", reply, e.user_hint());
                }
            }
        }

        draft.push(TurnRole::Assistant, reply.as_str());
        if let Err(e) = self.store.commit_turn(id, &draft.turns, &draft.facts).await {
            if let Some(emitted) = &document {
                self.discard(emitted).await;
            }
            return Err(e);
        }
        self.transition(TurnState::Completed);

        info!(iterations, degraded, document = document.is_some(), "Turn completed");

        Ok(TurnOutcome {
            reply,
            document,
            degraded,
            iterations,
        })
    }

    /// One reasoning round over the stored session plus the turn so far
    async fn reason(&self, session: &ConversationSession, text: &str) -> Result<Reasoning, EngineError> {
        let request = ReasoningRequest {
            conversation_id: session.id.clone(),
            message: text.to_string(),
            history: WorkingMemory::from_turns(&session.turns, self.settings.max_history_tokens)
                .into_turns(),
            facts: session.facts.clone(),
            capabilities: self.registry.schemas(),
        };

        self.with_retry("reasoning", self.settings.reasoning_timeout, || {
            self.reasoner.reason(&request)
        })
        .await
    }

    /// Run one capability request and record it, success or failure.
    async fn dispatch(&self, draft: &mut TurnDraft, mut call: CapabilityCall) -> Result<(), EngineError> {
        if call.id.is_empty() {
            call.id = format!("call_{}", Uuid::new_v4().simple());
        }
        debug!(capability = %call.name, "Dispatching capability");

        let result = self
            .with_retry(&call.name, self.settings.capability_timeout, || {
                self.registry.invoke(&call.name, &call.arguments)
            })
            .await;

        let outcome = match result {
            Ok(value) => CapabilityOutcome::Success { value },
            Err(e) => {
                let detail = secrets::scrub(&e.to_string());
                warn!(capability = %call.name, "Capability failed: {}", detail);
                if matches!(e, EngineError::Timeout { .. }) {
                    draft.audit(&detail);
                }
                CapabilityOutcome::Failure {
                    error: failure_feedback(&e),
                }
            }
        };

        let record = CapabilityRecord { call, outcome };
        let content = serde_json::to_string(&record)
            .map_err(|e| EngineError::Storage(format!("unserializable capability record: {}", e)))?;
        draft.push(TurnRole::Capability, content);
        Ok(())
    }

    async fn emit(
        &self,
        session: &ConversationSession,
        title_hint: Option<&str>,
    ) -> Result<EmittedDocument, EngineError> {
        let document = self.emitter.emit(session, title_hint).await;
        let handle = self.emitter.persist(&document).await?;
        Ok(EmittedDocument { document, handle })
    }

    /// Drop a document whose turn was never recorded
    async fn discard(&self, emitted: &EmittedDocument) {
        if let Err(e) = self.emitter.discard(&emitted.handle).await {
            warn!(
                path = %emitted.handle.path.display(),
                "Failed to discard unrecorded document: {}", e
            );
        }
    }

    /// Run `call` under `limit`, retrying once after `retry_delay` when the
    /// failure is transient.
    async fn with_retry<T, F, Fut>(&self, operation: &str, limit: Duration, mut call: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match timeout(limit, call()).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout {
                    operation: operation.to_string(),
                    secs: limit.as_secs(),
                }),
            };

            match result {
                Err(e) if e.is_transient() && attempt == 1 => {
                    warn!("{} failed ({}), retrying once", operation, e);
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
                other => return other,
            }
        }
    }
}

/// Turns and facts produced by a turn, held until it is committed.
///
/// `session` is the stored session with the pending turns and facts
/// already applied, so reasoning and emission see the turn so far.
struct TurnDraft {
    session: ConversationSession,
    turns: Vec<Turn>,
    facts: BTreeMap<String, String>,
}

impl TurnDraft {
    fn new(session: ConversationSession) -> Self {
        Self {
            session,
            turns: Vec::new(),
            facts: BTreeMap::new(),
        }
    }

    fn push(&mut self, role: TurnRole, content: impl Into<String>) {
        // stored timestamps have microsecond precision
        let now = Utc::now();
        let created_at = DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);
        let turn = Turn {
            role,
            content: content.into(),
            created_at,
        };
        self.session.turns.push(turn.clone());
        self.turns.push(turn);
    }

    fn set_fact(&mut self, key: &str, value: &str) {
        self.session.facts.insert(key.to_string(), value.to_string());
        self.facts.insert(key.to_string(), value.to_string());
    }

    fn audit(&mut self, detail: &str) {
        self.push(TurnRole::Audit, secrets::scrub(detail));
    }
}

/// What the reasoning collaborator is told about a failed capability
fn failure_feedback(err: &EngineError) -> String {
    match err {
        EngineError::UnknownCapability(name) => format!("unknown capability '{}'", name),
        EngineError::InvalidArguments { reason, .. } => format!("invalid arguments: {}", reason),
        _ => "capability unavailable".to_string(),
    }
}
