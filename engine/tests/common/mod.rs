//! Shared fixtures for integration tests: substitute collaborators and a
//! fully wired orchestrator over a temporary database.

#![allow(dead_code)]

use async_trait::async_trait;
use brief_engine::agent::{OrchestratorSettings, TurnOrchestrator};
use brief_engine::capability::github::{PullRequestDetail, PullRequestSummary, RepositorySummary};
use brief_engine::capability::{register_code_search, CapabilityRegistry, CodeHit, CodeSearch};
use brief_engine::db::{Database, SessionStore};
use brief_engine::document::{DocumentEmitter, DocumentStore, FileDocumentStore};
use brief_engine::llm::{DraftRequest, Reasoning, ReasoningCollaborator, ReasoningRequest};
use brief_engine::speech::SpeechCollaborator;
use brief_engine::transport::ChatTransport;
use sdk::errors::EngineError;
use sdk::types::{CapabilityRecord, TurnRole};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub type Rule = Box<dyn Fn(&ReasoningRequest) -> Result<Reasoning, EngineError> + Send + Sync>;

/// Reasoner driven by a closure over the request it receives.
///
/// Also tracks how many `reason` calls overlap, to observe serialization.
pub struct RuleReasoner {
    rule: Rule,
    pub calls: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub delay: Duration,
    pub requests: Mutex<Vec<ReasoningRequest>>,
    pub sections: BTreeMap<String, String>,
}

impl RuleReasoner {
    pub fn new<F>(rule: F) -> Self
    where
        F: Fn(&ReasoningRequest) -> Result<Reasoning, EngineError> + Send + Sync + 'static,
    {
        Self {
            rule: Box::new(rule),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            sections: BTreeMap::new(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_sections(mut self, sections: &[(&str, &str)]) -> Self {
        self.sections = sections
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningCollaborator for RuleReasoner {
    async fn reason(&self, request: &ReasoningRequest) -> Result<Reasoning, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.requests.lock().unwrap().push(request.clone());
        let result = (self.rule)(request);

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn draft_sections(&self, _request: &DraftRequest) -> Result<BTreeMap<String, String>, EngineError> {
        Ok(self.sections.clone())
    }
}

/// Capability records already present in the request's history
pub fn capability_records(request: &ReasoningRequest) -> Vec<CapabilityRecord> {
    request
        .history
        .iter()
        .filter(|t| t.role == TurnRole::Capability)
        .filter_map(|t| serde_json::from_str(&t.content).ok())
        .collect()
}

/// In-memory code search over a fixed list of files
pub struct FakeCodeSearch {
    pub files: Vec<(String, String)>,
    pub fail_with: Option<fn() -> EngineError>,
    pub searches: AtomicUsize,
}

impl FakeCodeSearch {
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(p, s)| (p.to_string(), s.to_string()))
                .collect(),
            fail_with: None,
            searches: AtomicUsize::new(0),
        }
    }

    pub fn failing(fail: fn() -> EngineError) -> Self {
        Self {
            files: Vec::new(),
            fail_with: Some(fail),
            searches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CodeSearch for FakeCodeSearch {
    async fn search(&self, query: &str, _repo: &str) -> Result<Vec<CodeHit>, EngineError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if let Some(fail) = self.fail_with {
            return Err(fail());
        }
        Ok(self
            .files
            .iter()
            .filter(|(path, snippet)| path.contains(query) || snippet.contains(query))
            .map(|(path, snippet)| CodeHit {
                path: path.clone(),
                snippet: snippet.clone(),
                url: None,
            })
            .collect())
    }

    async fn describe(&self, repo: &str) -> Result<RepositorySummary, EngineError> {
        Ok(RepositorySummary {
            full_name: repo.to_string(),
            description: Some("Online shop".to_string()),
            default_branch: "main".to_string(),
            language: Some("Rust".to_string()),
            topics: Vec::new(),
            open_issues: 0,
            pushed_at: None,
        })
    }

    async fn list_pull_requests(&self, _repo: &str, _state: &str) -> Result<Vec<PullRequestSummary>, EngineError> {
        Ok(Vec::new())
    }

    async fn pull_request(&self, repo: &str, number: u64) -> Result<PullRequestDetail, EngineError> {
        Err(EngineError::capability(
            "get_pull_request",
            format!("{}#{} not found", repo, number),
        ))
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub database: Database,
    pub store: Arc<dyn SessionStore>,
    pub registry: Arc<CapabilityRegistry>,
    pub emitter: Arc<DocumentEmitter>,
    pub orchestrator: Arc<TurnOrchestrator>,
}

impl Harness {
    pub fn output_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("prd")
    }
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        max_iterations: 4,
        reasoning_timeout: Duration::from_secs(5),
        capability_timeout: Duration::from_secs(5),
        retry_delay: Duration::from_millis(1),
        max_history_tokens: 8000,
    }
}

pub async fn harness(
    reasoner: Arc<dyn ReasoningCollaborator>,
    search: Option<Arc<dyn CodeSearch>>,
    settings: OrchestratorSettings,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let database = Database::new(&dir.path().join("brief.db")).await.unwrap();
    let store: Arc<dyn SessionStore> = Arc::new(database.sessions());

    let registry = Arc::new(CapabilityRegistry::new());
    if let Some(search) = search {
        register_code_search(&registry, search, Some("acme/shop".to_string()));
    }

    let documents: Arc<dyn DocumentStore> = Arc::new(FileDocumentStore::new(dir.path().join("prd")));
    let emitter = Arc::new(DocumentEmitter::new(
        Arc::clone(&reasoner),
        documents,
        Duration::from_secs(5),
    ));

    let orchestrator = Arc::new(TurnOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        reasoner,
        Arc::clone(&emitter),
        settings,
    ));

    Harness {
        dir,
        database,
        store,
        registry,
        emitter,
        orchestrator,
    }
}

/// Everything a transport was asked to send
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text(String, String),
    Voice(String, usize),
    Document { to: String, file_name: String, caption: Option<String> },
}

#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<Sent>>,
    pub audio: Vec<u8>,
    pub fail_voice: bool,
    pub fail_document: bool,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_text(&self, to: &str, text: &str) -> Result<(), EngineError> {
        self.sent.lock().unwrap().push(Sent::Text(to.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_voice(&self, to: &str, audio: Vec<u8>) -> Result<(), EngineError> {
        if self.fail_voice {
            return Err(EngineError::Network("voice upload failed".to_string()));
        }
        self.sent.lock().unwrap().push(Sent::Voice(to.to_string(), audio.len()));
        Ok(())
    }

    async fn send_document(
        &self,
        to: &str,
        file_name: &str,
        _content: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<(), EngineError> {
        if self.fail_document {
            return Err(EngineError::Network("document upload failed".to_string()));
        }
        self.sent.lock().unwrap().push(Sent::Document {
            to: to.to_string(),
            file_name: file_name.to_string(),
            caption: caption.map(str::to_string),
        });
        Ok(())
    }

    async fn download(&self, _file_ref: &str) -> Result<Vec<u8>, EngineError> {
        Ok(self.audio.clone())
    }
}

/// Speech double: transcribes to a fixed text, synthesizes to fixed bytes
pub struct FakeSpeech {
    pub transcript: Result<String, String>,
    pub synthesize: bool,
    pub language_hints: Mutex<Vec<Option<String>>>,
}

impl FakeSpeech {
    pub fn new(transcript: Result<&str, &str>, synthesize: bool) -> Self {
        Self {
            transcript: transcript.map(str::to_string).map_err(str::to_string),
            synthesize,
            language_hints: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SpeechCollaborator for FakeSpeech {
    async fn speech_to_text(
        &self,
        _audio: &[u8],
        _file_name: &str,
        language_hint: Option<&str>,
    ) -> Result<String, EngineError> {
        self.language_hints
            .lock()
            .unwrap()
            .push(language_hint.map(str::to_string));
        self.transcript.clone().map_err(EngineError::Transcription)
    }

    async fn text_to_speech(&self, _text: &str) -> Result<Vec<u8>, EngineError> {
        if self.synthesize {
            Ok(b"OggS-reply".to_vec())
        } else {
            Err(EngineError::Synthesis("voice unavailable".to_string()))
        }
    }
}
