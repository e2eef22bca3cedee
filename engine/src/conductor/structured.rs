//! Structured (JSON) model calls
//!
//! Stages that expect a JSON object from the model go through here. A reply
//! that does not parse into the stage's schema gets exactly one re-ask with
//! a stricter formatting instruction.

use crate::llm::{extract_json_object, CompletionRequest, LLMError, LLMProvider, Message};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StructuredError {
    /// The reply did not match the expected schema
    #[error("malformed model output: {0}")]
    Schema(String),

    /// No provider answered
    #[error(transparent)]
    Transport(#[from] LLMError),
}

const STRICT_FORMAT: &str = "Your previous reply could not be used";

/// Ask once and parse the first JSON object in the reply.
pub async fn ask_json<T, F>(
    llm: &dyn LLMProvider,
    request: &CompletionRequest,
    parse: F,
) -> Result<T, StructuredError>
where
    F: Fn(&serde_json::Value) -> Result<T, String>,
{
    let reply = llm.generate(request).await?;
    parse_reply(&reply, &parse).map_err(StructuredError::Schema)
}

/// Ask, and on a malformed reply re-ask once with a stricter instruction.
pub async fn ask_structured<T, F>(
    llm: &dyn LLMProvider,
    mut request: CompletionRequest,
    parse: F,
) -> Result<T, StructuredError>
where
    F: Fn(&serde_json::Value) -> Result<T, String>,
{
    let reply = llm.generate(&request).await?;
    let reason = match parse_reply(&reply, &parse) {
        Ok(value) => return Ok(value),
        Err(reason) => reason,
    };

    debug!("Re-asking after malformed reply: {}", reason);
    request.messages.push(Message::assistant(reply));
    request.messages.push(Message::user(format!(
        "{} ({}). Reply with ONLY one JSON object containing exactly the requested fields. \
         No markdown fences, no commentary.",
        STRICT_FORMAT, reason
    )));

    let reply = llm.generate(&request).await?;
    parse_reply(&reply, &parse).map_err(|reason| {
        warn!("Model output still malformed after re-ask: {}", reason);
        StructuredError::Schema(reason)
    })
}

fn parse_reply<T, F>(reply: &str, parse: &F) -> Result<T, String>
where
    F: Fn(&serde_json::Value) -> Result<T, String>,
{
    let value = extract_json_object(reply).ok_or_else(|| "no JSON object found".to_string())?;
    parse(&value)
}

/// Required string field
pub fn string_field(value: &serde_json::Value, key: &str) -> Result<String, String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| format!("field `{}` must be a string", key))
}

/// Optional list of strings; a missing or null field is empty
pub fn string_list_field(value: &serde_json::Value, key: &str) -> Result<Vec<String>, String> {
    match value.get(key) {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| format!("field `{}` must contain only strings", key))
            })
            .collect(),
        Some(_) => Err(format!("field `{}` must be a list", key)),
    }
}
