//! Document emitter
//!
//! Turns a conversation into a PRD: a fixed markdown template whose
//! free-text section bodies are drafted by the reasoning collaborator and
//! whose "Agreed decisions" table comes straight from the session's facts.
//! Persisted documents are never overwritten.

use crate::llm::{DraftRequest, ReasoningCollaborator};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use sdk::types::{ConversationId, ConversationSession};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Sections every document contains, in order
pub const REQUIRED_SECTIONS: [&str; 8] = [
    "Objective",
    "Context",
    "Functional Requirements",
    "Non-Functional Requirements",
    "User Stories",
    "Impact Analysis",
    "Effort Estimate",
    "Next Steps",
];

const SECTION_PLACEHOLDER: &str = "_To be defined._";
const MAX_TITLE_CHARS: usize = 50;
const DEFAULT_TITLE: &str = "feature";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedDocument {
    pub conversation_id: ConversationId,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Where a persisted document lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentHandle {
    pub path: PathBuf,
}

impl DocumentHandle {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Durable storage for generated documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store a new document; fails with `DocumentCollision` rather than
    /// replacing an existing one
    async fn persist(&self, document: &GeneratedDocument) -> Result<DocumentHandle, EngineError>;

    async fn read(&self, handle: &DocumentHandle) -> Result<String, EngineError>;

    /// Remove a document whose turn could not be recorded
    async fn discard(&self, handle: &DocumentHandle) -> Result<(), EngineError>;
}

/// Markdown files in one output directory
pub struct FileDocumentStore {
    output_dir: PathBuf,
}

impl FileDocumentStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `PRD_<sanitized title>_<YYYYmmdd_HHMMSS_micros>.md`
    pub fn file_name_for(document: &GeneratedDocument) -> String {
        format!(
            "PRD_{}_{}.md",
            sanitize_title(&document.title),
            document.created_at.format("%Y%m%d_%H%M%S_%6f")
        )
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn persist(&self, document: &GeneratedDocument) -> Result<DocumentHandle, EngineError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.output_dir.join(Self::file_name_for(document));

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(EngineError::DocumentCollision(path));
            }
            Err(e) => return Err(EngineError::Io(e)),
        };

        let written = async {
            file.write_all(document.body.as_bytes()).await?;
            file.sync_all().await
        }
        .await;
        remove_if_failed(&path, written).await?;

        info!(
            conversation_id = %document.conversation_id,
            path = %path.display(),
            "Document persisted"
        );
        Ok(DocumentHandle { path })
    }

    async fn read(&self, handle: &DocumentHandle) -> Result<String, EngineError> {
        Ok(tokio::fs::read_to_string(&handle.path).await?)
    }

    async fn discard(&self, handle: &DocumentHandle) -> Result<(), EngineError> {
        tokio::fs::remove_file(&handle.path).await?;
        info!(path = %handle.path.display(), "Document discarded");
        Ok(())
    }
}

/// A partially written file is deleted so no truncated document survives
async fn remove_if_failed(path: &Path, written: std::io::Result<()>) -> Result<(), EngineError> {
    let Err(e) = written else {
        return Ok(());
    };
    if let Err(remove_err) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), "Failed to remove partial document: {}", remove_err);
    }
    Err(EngineError::Io(e))
}

/// Keep alphanumerics, `-` and `_`; everything else becomes `_`.
/// At most 50 characters; an empty title becomes `feature`.
pub fn sanitize_title(title: &str) -> String {
    let sanitized: String = title
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(MAX_TITLE_CHARS)
        .collect();

    if sanitized.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        sanitized
    }
}

fn table_cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\r', '\n'], " ")
}

/// Render the fixed template. Sections are matched case-insensitively;
/// missing or blank ones get a placeholder.
pub fn render(
    title: &str,
    conversation_id: &ConversationId,
    created_at: DateTime<Utc>,
    facts: &BTreeMap<String, String>,
    sections: &BTreeMap<String, String>,
) -> String {
    let lookup: BTreeMap<String, &str> = sections
        .iter()
        .map(|(name, body)| (name.trim().to_lowercase(), body.trim()))
        .collect();

    let mut out = String::new();
    out.push_str(&format!("# PRD: {}\n\n", title));
    out.push_str(&format!("**Date:** {}  \n", created_at.format("%Y-%m-%d")));
    out.push_str("**Version:** 1.0  \n");
    out.push_str("**Status:** Draft  \n");
    out.push_str(&format!("**Conversation:** {}\n\n---\n\n", conversation_id));

    out.push_str("## Agreed decisions\n\n");
    if facts.is_empty() {
        out.push_str("_No decisions recorded._\n\n");
    } else {
        out.push_str("| Decision | Value |\n|---|---|\n");
        for (key, value) in facts {
            out.push_str(&format!("| {} | {} |\n", table_cell(key), table_cell(value)));
        }
        out.push('\n');
    }

    for (idx, name) in REQUIRED_SECTIONS.iter().enumerate() {
        let body = lookup
            .get(&name.to_lowercase())
            .copied()
            .filter(|b| !b.is_empty())
            .unwrap_or(SECTION_PLACEHOLDER);
        out.push_str(&format!("## {}. {}\n\n{}\n\n", idx + 1, name, body));
    }

    out
}

/// Builds and persists documents for a conversation
pub struct DocumentEmitter {
    reasoner: Arc<dyn ReasoningCollaborator>,
    store: Arc<dyn DocumentStore>,
    draft_timeout: Duration,
}

impl DocumentEmitter {
    pub fn new(
        reasoner: Arc<dyn ReasoningCollaborator>,
        store: Arc<dyn DocumentStore>,
        draft_timeout: Duration,
    ) -> Self {
        Self {
            reasoner,
            store,
            draft_timeout,
        }
    }

    /// Build the document for `session`.
    ///
    /// A failed or timed-out draft still yields a complete document: the
    /// facts table is filled and every section shows its placeholder.
    pub async fn emit(
        &self,
        session: &ConversationSession,
        title_hint: Option<&str>,
    ) -> GeneratedDocument {
        let title = title_hint
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .or_else(|| session.facts.get("title").map(String::as_str))
            .or_else(|| session.facts.get("feature").map(String::as_str))
            .unwrap_or("Feature")
            .to_string();

        let request = DraftRequest {
            conversation_id: session.id.clone(),
            title: title.clone(),
            history: session.dialogue().cloned().collect(),
            facts: session.facts.clone(),
            sections: REQUIRED_SECTIONS.iter().map(|s| s.to_string()).collect(),
        };

        let sections = match tokio::time::timeout(self.draft_timeout, self.reasoner.draft_sections(&request)).await {
            Ok(Ok(sections)) => sections,
            Ok(Err(e)) => {
                warn!(conversation_id = %session.id, "Section drafting failed: {}", e);
                BTreeMap::new()
            }
            Err(_) => {
                warn!(
                    conversation_id = %session.id,
                    "Section drafting timed out after {}s",
                    self.draft_timeout.as_secs()
                );
                BTreeMap::new()
            }
        };

        let created_at = Utc::now();
        GeneratedDocument {
            conversation_id: session.id.clone(),
            body: render(&title, &session.id, created_at, &session.facts, &sections),
            title,
            created_at,
        }
    }

    pub async fn persist(&self, document: &GeneratedDocument) -> Result<DocumentHandle, EngineError> {
        self.store.persist(document).await
    }

    pub async fn read(&self, handle: &DocumentHandle) -> Result<String, EngineError> {
        self.store.read(handle).await
    }

    pub async fn discard(&self, handle: &DocumentHandle) -> Result<(), EngineError> {
        self.store.discard(handle).await
    }
}
