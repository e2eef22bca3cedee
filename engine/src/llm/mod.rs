//! LLM Provider Abstraction Layer
//!
//! A common interface over the language-model backends (Ollama, OpenAI,
//! Anthropic). The pipeline stages only ever see `LLMProvider`; the router
//! implements the same trait and adds ranked failover on top.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod router;

pub use router::LLMRouter;

/// Result type for LLM operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Errors that can occur during LLM operations
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("All LLM providers failed")]
    AllProvidersExhausted,
}

impl From<LLMError> for sdk::EngineError {
    fn from(e: LLMError) -> Self {
        match e {
            LLMError::AllProvidersExhausted => sdk::EngineError::AllProvidersExhausted,
            other => sdk::EngineError::LLMProvider(other.to_string()),
        }
    }
}

/// Message in a prompt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Role of the message sender (user, assistant, system)
    pub role: MessageRole,

    /// Content of the message
    pub content: String,
}

impl Message {
    /// Create a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// One completion call: the prompt plus sampling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,

    /// Sampling temperature; 0.0 for deterministic stages
    #[serde(default)]
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            temperature: 0.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Total prompt size in characters
    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

/// LLM Provider trait that all providers must implement
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Returns the name of the provider (e.g., "ollama", "openai", "anthropic")
    fn name(&self) -> &str;

    /// Returns true if this is a local provider (e.g., Ollama), false for cloud providers
    fn is_local(&self) -> bool;

    /// Generate a completion and return the raw text
    async fn generate(&self, request: &CompletionRequest) -> Result<String>;

    /// Check if the provider is currently healthy and available
    /// Default implementation returns true.
    async fn check_health(&self) -> bool {
        true
    }
}

/// Map a failed HTTP status to an error the router can act on
pub(crate) fn status_error(status: reqwest::StatusCode, body: String) -> LLMError {
    match status.as_u16() {
        401 | 403 => LLMError::AuthenticationFailed(body),
        429 => LLMError::RateLimitExceeded,
        500..=599 => LLMError::ProviderUnavailable(format!("{}: {}", status, body)),
        _ => LLMError::InvalidRequest(body),
    }
}

pub(crate) fn transport_error(e: reqwest::Error) -> LLMError {
    if e.is_timeout() {
        LLMError::Timeout
    } else {
        LLMError::NetworkError(e.to_string())
    }
}

/// Extract the body of the first markdown code fence in the text.
///
/// Works even when there is trailing prose after the closing ```.
/// An unterminated fence yields everything after the opening line.
/// Returns `None` if no fenced block is found.
pub fn extract_fenced_block(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "json\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    let body_end = match content[body_start..].find("```") {
        Some(closing) => body_start + closing,
        None => content.len(),
    };

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// Extract a balanced JSON object starting at position 0 of `s`.
///
/// Counts `{` / `}` depth, respecting string literals, to find the
/// matching close brace.
pub fn extract_balanced_json(s: &str) -> Option<&str> {
    if !s.starts_with('{') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Find a JSON object in model output.
///
/// Handles the shapes models actually produce:
/// 1. The whole reply is a JSON object
/// 2. A fenced block, with or without a `json` tag and trailing prose
/// 3. An object embedded in prose
pub fn extract_json_object(content: &str) -> Option<serde_json::Value> {
    let trimmed = content.trim();

    let parse_object = |s: &str| {
        serde_json::from_str::<serde_json::Value>(s.trim())
            .ok()
            .filter(|v| v.is_object())
    };

    if let Some(value) = parse_object(trimmed) {
        return Some(value);
    }

    if let Some(inner) = extract_fenced_block(trimmed) {
        if let Some(value) = parse_object(inner) {
            return Some(value);
        }
    }

    for (pos, _) in trimmed.match_indices('{') {
        if let Some(candidate) = extract_balanced_json(&trimmed[pos..]) {
            if let Some(value) = parse_object(candidate) {
                return Some(value);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let user_msg = Message::user("Hello");
        assert_eq!(user_msg.role, MessageRole::User);
        assert_eq!(user_msg.content, "Hello");

        let system_msg = Message::system("You are a data analyst");
        assert_eq!(system_msg.role, MessageRole::System);
        assert_eq!(system_msg.role.to_string(), "system");
    }

    #[test]
    fn test_completion_request_defaults_to_zero_temperature() {
        let request = CompletionRequest::new(vec![Message::user("hi")]);
        assert_eq!(request.temperature, 0.0);
        assert_eq!(request.with_temperature(0.3).temperature, 0.3);
    }

    #[test]
    fn test_fenced_block_with_trailing_prose() {
        let content = "Here you go:\n```python\nresult = 1\n```\nLet me know!";
        assert_eq!(extract_fenced_block(content), Some("result = 1\n"));
    }

    #[test]
    fn test_unterminated_fence() {
        let content = "```\nresult = df.head()\n";
        assert_eq!(extract_fenced_block(content), Some("result = df.head()\n"));
    }

    #[test]
    fn test_balanced_json_respects_strings() {
        let s = r#"{"a": "}{", "b": {"c": 1}} trailing"#;
        assert_eq!(extract_balanced_json(s), Some(r#"{"a": "}{", "b": {"c": 1}}"#));
        assert_eq!(extract_balanced_json("no object"), None);
    }

    #[test]
    fn test_extract_json_object_shapes() {
        let expected = json!({"intent": "aggregate"});
        assert_eq!(extract_json_object(r#"{"intent": "aggregate"}"#), Some(expected.clone()));
        assert_eq!(
            extract_json_object("```json\n{\"intent\": \"aggregate\"}\n```"),
            Some(expected.clone())
        );
        assert_eq!(
            extract_json_object("Sure! {not json} then {\"intent\": \"aggregate\"} done"),
            Some(expected)
        );
        assert_eq!(extract_json_object("[1, 2]"), None);
        assert_eq!(extract_json_object("nothing here"), None);
    }
}
