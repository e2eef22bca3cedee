pub mod string;

pub use string::SecretString;

use keyring::Entry;
use regex::Regex;
use sdk::errors::EngineError;
use std::sync::OnceLock;

/// SecretManager resolves provider API keys.
///
/// Lookup order for a key such as `openai_api_key`:
/// 1. `SIFT_OPENAI_API_KEY` environment variable
/// 2. `OPENAI_API_KEY` environment variable
/// 3. The OS keychain entry under the manager's service name
///
/// Lookups never prompt; a missing key simply leaves the provider out of
/// the router.
pub struct SecretManager {
    service_name: String,
}

/// Regex patterns for detecting common secret formats.
static SECRET_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

/// Patterns match:
/// - OpenAI style keys: sk-...
/// - Anthropic keys: sk-ant-...
/// - Bearer tokens
/// - `x-api-key: ...` header echoes
fn get_secret_patterns() -> &'static Vec<Regex> {
    SECRET_PATTERNS.get_or_init(|| {
        [
            r"sk-[a-zA-Z0-9\-_]{20,}",
            r"Bearer\s+[^\s]{20,}",
            r"(?i)x-api-key:\s*[^\s]+",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Replace anything that looks like a credential with `[REDACTED]`.
///
/// Applied to every failure description before it is recorded on a run.
pub fn scrub_secrets(text: &str) -> String {
    let mut result = text.to_string();
    for pattern in get_secret_patterns() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }
    result
}

impl SecretManager {
    /// The service name namespaces entries in the OS keychain.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Resolve a secret from the environment, then the keychain.
    ///
    /// Returns `Ok(None)` when the secret is not configured anywhere.
    pub fn get_secret(&self, key: &str) -> Result<Option<SecretString>, EngineError> {
        for var in env_candidates(key) {
            if let Ok(value) = std::env::var(&var) {
                let secret = SecretString::new(value);
                if !secret.is_empty() {
                    tracing::debug!("Resolved secret '{}' from ${}", key, var);
                    return Ok(Some(secret));
                }
            }
        }

        let entry = Entry::new(&self.service_name, key).map_err(|e| {
            EngineError::KeyringError(format!("Failed to create keyring entry: {}", e))
        })?;

        match entry.get_password() {
            Ok(secret) => {
                tracing::debug!("Retrieved secret '{}' from keychain", key);
                Ok(Some(SecretString::new(secret)))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(EngineError::KeyringError(format!(
                "Failed to retrieve secret '{}': {}",
                key, e
            ))),
        }
    }

    /// Stores a secret in the OS keychain.
    pub fn set_secret(&self, key: &str, value: &str) -> Result<(), EngineError> {
        if value.trim().is_empty() {
            return Err(EngineError::KeyringError(
                "Secret cannot be empty".to_string(),
            ));
        }

        let entry = Entry::new(&self.service_name, key).map_err(|e| {
            EngineError::KeyringError(format!("Failed to create keyring entry: {}", e))
        })?;

        entry.set_password(value).map_err(|e| {
            EngineError::KeyringError(format!("Failed to store secret '{}': {}", key, e))
        })?;

        tracing::info!("Stored secret '{}' in keychain", key);
        Ok(())
    }

    /// Deletes a secret from the OS keychain.
    pub fn delete_secret(&self, key: &str) -> Result<(), EngineError> {
        let entry = Entry::new(&self.service_name, key).map_err(|e| {
            EngineError::KeyringError(format!("Failed to create keyring entry: {}", e))
        })?;

        entry.delete_password().map_err(|e| {
            EngineError::KeyringError(format!("Failed to delete secret '{}': {}", key, e))
        })?;

        tracing::info!("Deleted secret '{}' from keychain", key);
        Ok(())
    }

    /// Checks whether a secret is configured anywhere, swallowing keychain errors.
    pub fn has_secret(&self, key: &str) -> bool {
        matches!(self.get_secret(key), Ok(Some(_)))
    }

    pub fn scrub(&self, text: &str) -> String {
        scrub_secrets(text)
    }
}

fn env_candidates(key: &str) -> [String; 2] {
    let upper = key.to_ascii_uppercase();
    [format!("SIFT_{}", upper), upper]
}
