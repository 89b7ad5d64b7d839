//! Vendor credentials required to run the listener.

use crate::secrets::{SecretManager, SecretString};
use sdk::errors::EngineError;

pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
pub const GITHUB_ACCESS_TOKEN: &str = "GITHUB_ACCESS_TOKEN";

/// All credential names, in the order they are reported when missing
pub const REQUIRED: [&str; 3] = [OPENAI_API_KEY, TELEGRAM_BOT_TOKEN, GITHUB_ACCESS_TOKEN];

#[derive(Debug, Clone)]
pub struct Credentials {
    pub openai_api_key: SecretString,
    pub telegram_bot_token: SecretString,
    pub github_access_token: SecretString,
}

impl Credentials {
    /// Resolve every credential through the secret manager.
    pub fn resolve(secrets: &SecretManager) -> Result<Self, EngineError> {
        Self::resolve_with(|name| secrets.lookup(name))
    }

    /// Resolve with an arbitrary lookup.
    ///
    /// Fails with `EngineError::Configuration` naming every missing
    /// credential, not just the first one.
    pub fn resolve_with<F>(lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<SecretString>,
    {
        let mut found = REQUIRED.map(|name| lookup(name));
        let missing: Vec<String> = REQUIRED
            .iter()
            .zip(found.iter())
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| (*name).to_string())
            .collect();

        if !missing.is_empty() {
            return Err(EngineError::Configuration { missing });
        }

        let [openai, telegram, github] = &mut found;
        match (openai.take(), telegram.take(), github.take()) {
            (Some(openai_api_key), Some(telegram_bot_token), Some(github_access_token)) => {
                Ok(Self {
                    openai_api_key,
                    telegram_bot_token,
                    github_access_token,
                })
            }
            _ => Err(EngineError::Configuration {
                missing: REQUIRED.iter().map(|s| s.to_string()).collect(),
            }),
        }
    }
}
