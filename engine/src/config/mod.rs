//! Configuration management
//!
//! This module handles loading, validation, and management of the Brief configuration.
//! Configuration is stored in TOML format at ~/.brief/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **llm**: Reasoning collaborator endpoint, model and limits
//! - **orchestrator**: Iteration cap, capability timeout, retry pause
//! - **github**: Code-search endpoint and target repository
//! - **speech**: Transcription/synthesis endpoint, language and voice
//! - **telegram**: Allowed users, polling and rate limits
//! - **documents**: Output directory for generated documents
//!
//! Credentials are deliberately absent from this file; see [`credentials`].
//!
//! # Path Expansion
//!
//! `~` is expanded to the user's home directory for `core.data_dir` and
//! `documents.output_dir`, and both directories are created when missing.
//!
//! # Examples
//!
//! ```no_run
//! use brief_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Model: {}", config.llm.model);
//! println!("Repository: {:?}", config.github.repository);
//! # Ok(())
//! # }
//! ```

pub mod credentials;

pub use credentials::Credentials;

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Reasoning collaborator settings
    #[serde(default)]
    pub llm: LLMConfig,

    /// Turn orchestrator limits
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Code-search collaborator settings
    #[serde(default)]
    pub github: GithubConfig,

    /// Speech collaborator settings
    #[serde(default)]
    pub speech: SpeechConfig,

    /// Telegram transport settings
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Document emitter settings
    #[serde(default)]
    pub documents: DocumentsConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion); holds brief.db
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Reasoning collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Base URL for the OpenAI-compatible API
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model name (overridden by MODEL_ID)
    #[serde(default = "default_model")]
    pub model: String,

    /// Timeout for each reasoning call in seconds
    #[serde(default = "default_reasoning_timeout")]
    pub reasoning_timeout_secs: u64,

    /// Token budget for history handed to the reasoning collaborator
    #[serde(default = "default_max_history_tokens")]
    pub max_history_tokens: usize,
}

/// Turn orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum reasoning/capability rounds per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Timeout for each capability call in seconds
    #[serde(default = "default_capability_timeout")]
    pub capability_timeout_secs: u64,

    /// Pause before the single retry of a transient failure
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Code-search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    /// Base URL for the GitHub REST API
    #[serde(default = "default_github_base_url")]
    pub api_base_url: String,

    /// Target repository as owner/name (overridden by GITHUB_REPO)
    #[serde(default)]
    pub repository: Option<String>,

    /// Maximum search hits returned per query
    #[serde(default = "default_max_search_results")]
    pub max_results: usize,
}

/// Speech collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Base URL for the OpenAI-compatible audio API
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Language hint for transcription (ISO-639-1)
    #[serde(default = "default_language")]
    pub language: String,

    /// Voice used for synthesized replies
    #[serde(default = "default_voice")]
    pub voice: String,

    /// Reply with synthesized voice instead of text
    #[serde(default = "default_true")]
    pub reply_with_voice: bool,

    /// Timeout for each speech call in seconds
    #[serde(default = "default_speech_timeout")]
    pub timeout_secs: u64,
}

/// Telegram transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Base URL for the Bot API
    #[serde(default = "default_telegram_base_url")]
    pub api_base_url: String,

    /// User ids allowed to talk to the bot (empty = everyone)
    #[serde(default)]
    pub allowed_users: Vec<i64>,

    /// Long-polling timeout in seconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Per-user message budget per hour
    #[serde(default = "default_max_messages_per_hour")]
    pub max_messages_per_hour: usize,
}

/// Document emitter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentsConfig {
    /// Output directory for generated documents (supports ~ expansion)
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.brief")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("~/.brief/output/prd")
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_reasoning_timeout() -> u64 {
    120
}

fn default_max_history_tokens() -> usize {
    8000
}

fn default_max_iterations() -> usize {
    8
}

fn default_capability_timeout() -> u64 {
    30
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_github_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_max_search_results() -> usize {
    10
}

fn default_language() -> String {
    "pt".to_string()
}

fn default_voice() -> String {
    "onyx".to_string()
}

fn default_speech_timeout() -> u64 {
    60
}

fn default_telegram_base_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout() -> u64 {
    30
}

fn default_max_messages_per_hour() -> usize {
    60
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_model(),
            reasoning_timeout_secs: default_reasoning_timeout(),
            max_history_tokens: default_max_history_tokens(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            capability_timeout_secs: default_capability_timeout(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_github_base_url(),
            repository: None,
            max_results: default_max_search_results(),
        }
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            language: default_language(),
            voice: default_voice(),
            reply_with_voice: true,
            timeout_secs: default_speech_timeout(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_telegram_base_url(),
            allowed_users: Vec::new(),
            poll_timeout_secs: default_poll_timeout(),
            max_messages_per_hour: default_max_messages_per_hour(),
        }
    }
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            llm: LLMConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            github: GithubConfig::default(),
            speech: SpeechConfig::default(),
            telegram: TelegramConfig::default(),
            documents: DocumentsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.brief/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let config = Self::default();

        // The file keeps the unexpanded defaults so it stays portable
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = config;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.brief/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".brief").join("config.toml"))
    }

    /// Apply `GITHUB_REPO` and `MODEL_ID` overrides
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(repo) = lookup("GITHUB_REPO").filter(|r| !r.trim().is_empty()) {
            self.github.repository = Some(repo.trim().to_string());
        }
        if let Some(model) = lookup("MODEL_ID").filter(|m| !m.trim().is_empty()) {
            self.llm.model = model.trim().to_string();
        }
    }

    /// Path of the session database inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join("brief.db")
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates log level, limits and repository format
    /// - Expands ~ in paths
    /// - Creates the data and output directories if they don't exist
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.orchestrator.max_iterations == 0 {
            return Err(EngineError::Config(
                "orchestrator.max_iterations must be at least 1".to_string(),
            ));
        }

        if self.llm.reasoning_timeout_secs == 0
            || self.orchestrator.capability_timeout_secs == 0
            || self.speech.timeout_secs == 0
        {
            return Err(EngineError::Config(
                "timeouts must be greater than zero".to_string(),
            ));
        }

        if let Some(repo) = &self.github.repository {
            let mut parts = repo.split('/');
            let valid = matches!(
                (parts.next(), parts.next(), parts.next()),
                (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
            );
            if !valid {
                return Err(EngineError::Config(format!(
                    "github.repository must be in owner/name form, got '{}'",
                    repo
                )));
            }
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        create_dir(&self.core.data_dir)?;

        self.documents.output_dir = expand_path(&self.documents.output_dir)?;
        create_dir(&self.documents.output_dir)?;

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

fn create_dir(path: &Path) -> Result<(), EngineError> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| {
            EngineError::Config(format!("Failed to create directory {:?}: {}", path, e))
        })?;
    }
    if !path.is_dir() {
        return Err(EngineError::Config(format!(
            "Path is not a directory: {:?}",
            path
        )));
    }
    Ok(())
}
