//! Command handlers for CLI operations
//!
//! - doctor: validate configuration, credentials and storage
//! - session list / show / reset: operator access to stored conversations

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;

use crate::config::{credentials, Config};
use crate::db::{Database, SessionStore};
use crate::secrets::{SecretManager, SecretString};
use sdk::types::{CapabilityRecord, ConversationId, TurnRole};

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub checks: Vec<Check>,
    pub issues: Vec<String>,
}

impl DoctorReport {
    pub fn healthy(&self) -> bool {
        self.issues.is_empty()
    }

    fn check(&mut self, name: &str, status: impl Into<String>) {
        self.checks.push(Check {
            name: name.to_string(),
            status: status.into(),
        });
    }
}

/// Run every check. `lookup` resolves credentials by name.
pub async fn diagnose<F>(config: &Config, lookup: F) -> DoctorReport
where
    F: Fn(&str) -> Option<SecretString>,
{
    let mut report = DoctorReport {
        checks: Vec::new(),
        issues: Vec::new(),
    };

    // loading already validated it
    report.check("Configuration", "Valid");
    report.check("Model", config.llm.model.clone());

    match &config.github.repository {
        Some(repo) => report.check("Repository", repo.clone()),
        None => {
            report.check("Repository", "Not configured");
            report
                .issues
                .push("No default repository. Set github.repository or GITHUB_REPO.".to_string());
        }
    }

    for name in credentials::REQUIRED {
        if lookup(name).is_some() {
            report.check(name, "Configured");
        } else {
            report.check(name, "Missing");
            report.issues.push(format!(
                "{} is not set in the environment or the OS keychain",
                name
            ));
        }
    }

    if config.telegram.allowed_users.is_empty() {
        report.check("Allowed users", "Everyone");
    } else {
        report.check(
            "Allowed users",
            format!("{} user(s)", config.telegram.allowed_users.len()),
        );
    }

    let db_path = config.database_path();
    match Database::new(&db_path).await {
        Ok(db) => {
            report.check("Database", format!("OK ({})", db_path.display()));
            match db.sessions().list_conversations().await {
                Ok(conversations) => report.check("Conversations", conversations.len().to_string()),
                Err(e) => report.issues.push(format!("Cannot read conversations: {}", e)),
            }
            if let Err(e) = db.close().await {
                report.issues.push(format!("Cannot close database: {}", e));
            }
        }
        Err(e) => {
            report.check("Database", "Failed");
            report
                .issues
                .push(format!("Cannot open database {}: {:#}", db_path.display(), e));
        }
    }

    let output_dir = &config.documents.output_dir;
    if output_dir.is_dir() {
        report.check("Output directory", output_dir.display().to_string());
    } else {
        report.check("Output directory", "Missing");
        report
            .issues
            .push(format!("Output directory does not exist: {}", output_dir.display()));
    }

    report
}

pub async fn handle_doctor(config: &Config, format: OutputFormat) -> Result<()> {
    let secrets = SecretManager::new("brief");
    let report = diagnose(config, |name| secrets.lookup(name)).await;

    match format {
        OutputFormat::Text => {
            println!("Brief Diagnostics");
            println!("=================");
            println!();
            for check in &report.checks {
                println!("  {:<25} {}", format!("{}:", check.name), check.status);
            }
            println!();

            if report.healthy() {
                println!("✓ All checks passed!");
            } else {
                println!("⚠ Issues found:");
                println!();
                for (i, issue) in report.issues.iter().enumerate() {
                    println!("  {}. {}", i + 1, issue);
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "checks": report.checks,
                "issues": report.issues,
                "healthy": report.healthy()
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

async fn open(config: &Config) -> Result<Database> {
    Database::new(&config.database_path())
        .await
        .context("Failed to open database")
}

pub async fn handle_session_list(config: &Config, format: OutputFormat) -> Result<()> {
    let db = open(config).await?;
    let conversations = db
        .sessions()
        .list_conversations()
        .await
        .context("Failed to list conversations")?;

    match format {
        OutputFormat::Text => {
            if conversations.is_empty() {
                println!("No conversations stored");
            } else {
                println!("{:<30} {:>6} {:>6}  LAST ACTIVE", "CONVERSATION", "TURNS", "FACTS");
                for c in &conversations {
                    println!(
                        "{:<30} {:>6} {:>6}  {}",
                        c.id.as_str(),
                        c.turn_count,
                        c.fact_count,
                        c.updated_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "conversations": conversations,
                "count": conversations.len()
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    db.close().await
}

pub async fn handle_session_show(id: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let db = open(config).await?;
    let session = db
        .sessions()
        .load(&ConversationId::from(id))
        .await
        .with_context(|| format!("Failed to load conversation {}", id))?;

    match format {
        OutputFormat::Text => {
            if session.is_empty() {
                println!("Conversation {} has no stored state", id);
            } else {
                println!("Conversation {}", id);
                println!();
                for turn in &session.turns {
                    println!(
                        "[{}] {:<10} {}",
                        turn.created_at.format("%Y-%m-%d %H:%M:%S"),
                        turn.role.as_str(),
                        describe_turn(turn.role, &turn.content)
                    );
                }
                if !session.facts.is_empty() {
                    println!();
                    println!("Agreed facts:");
                    for (key, value) in &session.facts {
                        println!("  {}: {}", key, value);
                    }
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
    }

    db.close().await
}

pub async fn handle_session_reset(
    id: &str,
    facts: bool,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let db = open(config).await?;
    let report = db
        .sessions()
        .reset(&ConversationId::from(id), facts)
        .await
        .with_context(|| format!("Failed to reset conversation {}", id))?;

    match format {
        OutputFormat::Text => println!(
            "Reset {}: {} turn(s) and {} fact(s) removed",
            id, report.turns_removed, report.facts_removed
        ),
        OutputFormat::Json => {
            let output = json!({ "conversation_id": id, "reset": report });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    db.close().await
}

/// One-line rendering of a stored turn; capability records are summarized
fn describe_turn(role: TurnRole, content: &str) -> String {
    if role == TurnRole::Capability {
        if let Ok(record) = serde_json::from_str::<CapabilityRecord>(content) {
            let status = if record.outcome.is_success() { "ok" } else { "failed" };
            return format!("{} ({})", record.call.name, status);
        }
    }
    content.replace('\n', " ")
}
