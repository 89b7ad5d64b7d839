pub mod string;

pub use string::SecretString;

use keyring::Entry;
use regex::Regex;
use std::sync::OnceLock;

/// SecretManager resolves credentials and redacts them from outgoing text.
///
/// Lookup order for a credential named e.g. `OPENAI_API_KEY`:
/// 1. the process environment (a `.env` file is loaded at startup)
/// 2. the OS keychain entry `<service>/openai_api_key`
///
/// Lookups never prompt. A missing credential is reported, not asked for,
/// so the listener can run unattended.
pub struct SecretManager {
    service_name: String,
}

static SECRET_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

/// Patterns for the credential formats this service handles.
///
/// - OpenAI API keys: sk-..., sk-proj-...
/// - Telegram bot tokens: <bot id>:<35 chars>
/// - GitHub tokens: ghp_/gho_/ghs_ classic and github_pat_ fine-grained
/// - Bearer tokens in echoed headers
fn get_secret_patterns() -> &'static Vec<Regex> {
    SECRET_PATTERNS.get_or_init(|| {
        [
            r"sk-[a-zA-Z0-9\-_]{20,}",
            r"\b[0-9]{8,10}:[a-zA-Z0-9\-_]{35}\b",
            r"gh[pos]_[a-zA-Z0-9]{36}",
            r"github_pat_[a-zA-Z0-9_]{22,}",
            r"Bearer\s+[^\s]{20,}",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

impl SecretManager {
    /// Creates a new SecretManager; the service name namespaces keychain entries.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Resolve a credential from the environment, then the keychain.
    ///
    /// Blank values count as missing.
    pub fn lookup(&self, name: &str) -> Option<SecretString> {
        if let Some(value) = std::env::var(name).ok().filter(|v| !v.trim().is_empty()) {
            tracing::debug!("Resolved '{}' from environment", name);
            return Some(SecretString::new(value.trim()));
        }
        self.from_keychain(&name.to_lowercase())
    }

    /// Keychain lookup; any keychain failure is treated as "not stored".
    fn from_keychain(&self, key: &str) -> Option<SecretString> {
        let entry = match Entry::new(&self.service_name, key) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("Keychain unavailable for '{}': {}", key, e);
                return None;
            }
        };

        match entry.get_password() {
            Ok(secret) if !secret.trim().is_empty() => {
                tracing::debug!("Resolved '{}' from keychain", key);
                Some(SecretString::new(secret.trim()))
            }
            Ok(_) | Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                tracing::debug!("Keychain lookup for '{}' failed: {}", key, e);
                None
            }
        }
    }

    /// Replace every detected credential in `text` with `[REDACTED]`.
    ///
    /// Applied to everything sent to a chat user and to logged error strings.
    ///
    /// ```
    /// use brief_engine::secrets::SecretManager;
    ///
    /// let manager = SecretManager::new("test");
    /// let scrubbed = manager.scrub("key sk-1234567890abcdefghij leaked");
    /// assert_eq!(scrubbed, "key [REDACTED] leaked");
    /// ```
    pub fn scrub(&self, text: &str) -> String {
        scrub(text)
    }
}

/// Free-function form of [`SecretManager::scrub`] for call sites without a manager.
pub fn scrub(text: &str) -> String {
    let mut result = text.to_string();
    for pattern in get_secret_patterns() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }
    result
}
