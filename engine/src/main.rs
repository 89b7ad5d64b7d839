// Brief requirements-intake bot
// Main entry point for the brief binary

use clap::Parser;
use brief_engine::app::AppContext;
use brief_engine::cli::{Cli, Command, SessionAction};
use brief_engine::config::{Config, Credentials};
use brief_engine::handlers::{
    handle_doctor, handle_session_list, handle_session_reset, handle_session_show, OutputFormat,
};
use brief_engine::secrets::SecretManager;
use brief_engine::telemetry::init_telemetry_with_level;
use sdk::errors::EngineError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; real environment variables win
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    init_telemetry_with_level(&config.core.log_level);

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");
    tracing::info!("Brief v{} ({} - {})", version, commit, timestamp);

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    match cli.command().clone() {
        Command::Start => {
            let credentials = match Credentials::resolve(&SecretManager::new("brief")) {
                Ok(credentials) => credentials,
                Err(EngineError::Configuration { missing }) => {
                    eprintln!("Missing required credentials:");
                    for name in &missing {
                        eprintln!("  - {}", name);
                    }
                    eprintln!("Set them in the environment, a .env file or the OS keychain.");
                    std::process::exit(2);
                }
                Err(e) => return Err(e.into()),
            };

            tracing::info!("Starting listener...");
            let app = AppContext::bootstrap(config, credentials).await?;
            app.run().await
        }

        Command::Doctor => {
            tracing::info!("Running diagnostics...");
            handle_doctor(&config, format).await
        }

        Command::Session { action } => match action {
            SessionAction::List => handle_session_list(&config, format).await,
            SessionAction::Show { id } => handle_session_show(&id, &config, format).await,
            SessionAction::Reset { id, facts } => {
                tracing::info!("Resetting conversation {}", id);
                handle_session_reset(&id, facts, &config, format).await
            }
        },
    }
}
