//! Error types and handling
//!
//! This module provides the engine-level error type shared by the Sift
//! engine and its collaborators. All errors implement the `SiftErrorExt`
//! trait which provides user-friendly hints and indicates whether errors
//! are recoverable.
//!
//! # Security
//!
//! All error messages are scrubbed to ensure:
//! - No secrets (API keys, tokens) are included
//! - No generated code is echoed back to end users
//! - All hints are safe to display to end users

use thiserror::Error;

/// Trait for Sift error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information.
pub trait SiftErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain:
    /// - Secrets (API keys, tokens, passwords)
    /// - File paths
    /// - Internal implementation details
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors typically require a configuration change.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// Covers the infrastructure around the analysis pipeline: configuration,
/// persistence, datasets, rate limiting and provider access. Failures inside
/// a pipeline run are not reported through this type; they are categorized
/// on the run itself and never abort the process.
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, SiftErrorExt};
///
/// let error = EngineError::Dataset("sales.csv has no header row".to_string());
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
///
/// let fatal_error = EngineError::AllProvidersExhausted;
/// assert!(!fatal_error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // Dataset errors
    #[error("Dataset error: {0}")]
    Dataset(String),

    // LLM provider errors
    #[error("LLM provider error: {0}")]
    LLMProvider(String),

    #[error("All LLM providers exhausted")]
    AllProvidersExhausted,

    // Sandbox errors
    #[error("Sandbox worker unavailable: {0}")]
    SandboxUnavailable(String),

    // Request validation errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Rate limiting errors
    #[error("Rate limit exceeded for {src}: {count}/{limit} requests in {window}")]
    RateLimitExceeded {
        src: String,
        count: i64,
        limit: i64,
        window: String,
    },

    // Keyring errors
    #[error("Keyring error: {0}")]
    KeyringError(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SiftErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Database(_) => "Database operation failed. Check the data directory",
            Self::Dataset(_) => "The file could not be read. Check that it is a valid CSV",
            Self::LLMProvider(_) => "LLM provider unavailable. Check your API keys and network",
            Self::AllProvidersExhausted => "No LLM providers available. Check configuration",
            Self::SandboxUnavailable(_) => "The analysis sandbox could not be started",
            Self::InvalidRequest(_) => "The question or session is not valid",
            Self::RateLimitExceeded { .. } => {
                "Rate limit exceeded. Please wait before trying again"
            }
            Self::KeyringError(_) => "Failed to access secure storage. Check system keychain",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Config(_) | Self::AllProvidersExhausted | Self::SandboxUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_hints_are_static() {
        let err = EngineError::Dataset("/home/alice/secret/path.csv".to_string());
        assert!(!err.user_hint().contains("/home/alice"));
    }

    #[test]
    fn test_rate_limit_display() {
        let err = EngineError::RateLimitExceeded {
            src: "session-1".to_string(),
            count: 10,
            limit: 10,
            window: "1 minute".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Rate limit exceeded for session-1: 10/10 requests in 1 minute"
        );
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_config_errors_not_recoverable() {
        assert!(!EngineError::Config("bad".to_string()).is_recoverable());
        assert!(!EngineError::SandboxUnavailable("missing".to_string()).is_recoverable());
        assert!(EngineError::Database("locked".to_string()).is_recoverable());
    }
}
