//! Application wiring
//!
//! Builds every component once from `Config` and `Credentials` and runs the
//! Telegram listener until a shutdown signal arrives.
//!
//! # Graceful Shutdown
//!
//! On Ctrl+C or SIGTERM:
//! 1. Stop polling for new messages
//! 2. Wait up to 30 seconds for messages already dispatched
//! 3. Flush the SQLite WAL and close the pool

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::agent::{OrchestratorSettings, TurnOrchestrator};
use crate::capability::{register_code_search, CapabilityRegistry, GithubCodeSearch};
use crate::config::{Config, Credentials};
use crate::db::{Database, SessionStore};
use crate::document::{DocumentEmitter, DocumentStore, FileDocumentStore};
use crate::llm::{OpenAiReasoner, ReasoningCollaborator};
use crate::speech::{OpenAiSpeech, SpeechCollaborator};
use crate::transport::{
    ChatGateway, ChatTransport, ConversationDispatcher, EventHandler, ReplySettings,
    TelegramTransport,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Everything the listener needs, built once and shared by reference
pub struct AppContext {
    pub config: Config,
    pub database: Database,
    pub store: Arc<dyn SessionStore>,
    pub registry: Arc<CapabilityRegistry>,
    pub reasoner: Arc<dyn ReasoningCollaborator>,
    pub speech: Arc<dyn SpeechCollaborator>,
    pub emitter: Arc<DocumentEmitter>,
    pub orchestrator: Arc<TurnOrchestrator>,
    pub telegram: Arc<TelegramTransport>,
}

impl AppContext {
    pub async fn bootstrap(config: Config, credentials: Credentials) -> Result<Self> {
        let database = Database::new(&config.database_path())
            .await
            .context("Failed to open session database")?;
        let store: Arc<dyn SessionStore> = Arc::new(database.sessions());

        let registry = Arc::new(CapabilityRegistry::new());
        let github = GithubCodeSearch::new(
            config.github.api_base_url.clone(),
            credentials.github_access_token.clone(),
            config.github.max_results,
            Duration::from_secs(config.orchestrator.capability_timeout_secs),
        )?;
        register_code_search(&registry, Arc::new(github), config.github.repository.clone());

        let reasoner: Arc<dyn ReasoningCollaborator> = Arc::new(OpenAiReasoner::new(
            config.llm.base_url.clone(),
            credentials.openai_api_key.clone(),
            config.llm.model.clone(),
            Duration::from_secs(config.llm.reasoning_timeout_secs),
        )?);

        let speech: Arc<dyn SpeechCollaborator> = Arc::new(OpenAiSpeech::new(
            config.speech.base_url.clone(),
            credentials.openai_api_key.clone(),
            config.speech.voice.clone(),
            Duration::from_secs(config.speech.timeout_secs),
        )?);

        let documents: Arc<dyn DocumentStore> =
            Arc::new(FileDocumentStore::new(config.documents.output_dir.clone()));
        let emitter = Arc::new(DocumentEmitter::new(
            Arc::clone(&reasoner),
            documents,
            Duration::from_secs(config.llm.reasoning_timeout_secs),
        ));

        let orchestrator = Arc::new(TurnOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&reasoner),
            Arc::clone(&emitter),
            OrchestratorSettings::from_config(&config),
        ));

        let telegram = Arc::new(TelegramTransport::new(
            &config.telegram,
            credentials.telegram_bot_token.clone(),
        )?);

        info!(
            capabilities = registry.schemas().len(),
            repository = config.github.repository.as_deref().unwrap_or("<none>"),
            model = %config.llm.model,
            "Brief initialized"
        );

        Ok(Self {
            config,
            database,
            store,
            registry,
            reasoner,
            speech,
            emitter,
            orchestrator,
            telegram,
        })
    }

    /// Run the listener until Ctrl+C or SIGTERM, then shut down cleanly
    pub async fn run(self) -> Result<()> {
        let gateway: Arc<dyn EventHandler> = Arc::new(ChatGateway::new(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.telegram) as Arc<dyn ChatTransport>,
            Arc::clone(&self.speech),
            ReplySettings::from_config(&self.config),
        ));
        let dispatcher = ConversationDispatcher::new(gateway);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let signals = tokio::spawn(async move {
            wait_for_signal().await;
            let _ = shutdown_tx.send(true);
        });

        let polled = self.telegram.run(&dispatcher, shutdown_rx).await;
        signals.abort();

        info!("Waiting up to {}s for in-progress messages", SHUTDOWN_GRACE.as_secs());
        if !dispatcher.drain(SHUTDOWN_GRACE).await {
            warn!("{} message(s) still in progress at shutdown", dispatcher.in_flight());
        }

        if let Err(e) = self.database.close().await {
            error!("Failed to close database: {}", e);
        }

        info!("Graceful shutdown completed");
        polled
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C");
}
