//! CLI interface for Brief
//!
//! Defines the `brief` command line with clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Brief: a requirements-intake bot
///
/// Talks with stakeholders over Telegram, checks their requests against a
/// GitHub repository and writes PRDs when the conversation is complete.
#[derive(Parser, Debug)]
#[command(name = "brief")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Defaults to `start`
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    pub fn command(&self) -> &Command {
        self.command.as_ref().unwrap_or(&Command::Start)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the Telegram listener until Ctrl+C or SIGTERM
    Start,

    /// Check configuration, credentials and storage
    Doctor,

    /// Inspect or reset stored conversations
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// List known conversations, most recent first
    List,

    /// Print a conversation's history and agreed facts
    Show {
        /// Conversation id, e.g. telegram:123456
        id: String,
    },

    /// Delete a conversation's history
    Reset {
        id: String,

        /// Delete agreed facts as well
        #[arg(long)]
        facts: bool,
    },
}
