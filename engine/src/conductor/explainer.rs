//! Result explanation
//!
//! Turns a computed result into a short narrative plus recommendations.
//! Also builds the fixed explanations used when a run ends without a
//! result; those never echo generated code.

use super::state::{FailureKind, Intent, OperationType};
use super::structured::{ask_structured, string_field, string_list_field, StructuredError};
use crate::llm::{CompletionRequest, LLMProvider, Message};
use sdk::ResultValue;
use std::sync::Arc;

/// Temperature for narrative output
const EXPLAIN_TEMPERATURE: f32 = 0.3;

/// Recommendations attached to terminal failures
pub const FALLBACK_RECOMMENDATIONS: [&str; 3] = [
    "Try a simpler query first",
    "Check available column names in your files",
    "Please try rephrasing your question",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Explanation {
    pub explanation: String,
    pub recommendations: Vec<String>,
}

pub struct Explainer {
    llm: Arc<dyn LLMProvider>,
    preview_chars: usize,
}

impl Explainer {
    pub fn new(llm: Arc<dyn LLMProvider>, preview_chars: usize) -> Self {
        Self { llm, preview_chars }
    }

    pub async fn explain(
        &self,
        query: &str,
        result: &ResultValue,
        files_used: &[String],
        intent: Option<Intent>,
        operation_type: Option<OperationType>,
    ) -> Result<Explanation, StructuredError> {
        if is_empty_result(result) {
            return Ok(Explanation {
                explanation: "The analysis ran but returned no rows.".to_string(),
                recommendations: vec!["Please try a different query".to_string()],
            });
        }

        let system = Message::system(
            "You are a data analyst explaining results to a business user. Start with a \
             direct answer to the question, use specific numbers from the result, keep it \
             to 3-5 sentences, and offer 1-2 actionable recommendations. Put a space between \
             every word and number.\n\
             Respond with a JSON object:\n\
             {\"explanation\": \"...\", \"recommendations\": [\"...\"]}",
        );
        let analysis_type = format!(
            "{} ({})",
            intent.map(|i| i.as_str()).unwrap_or("query"),
            operation_type.map(|o| o.as_str()).unwrap_or("single_table")
        );
        let user = Message::user(format!(
            "User query: {}\n\nAnalysis result:\n{}\n\nFiles used: {}\nAnalysis type: {}",
            query,
            result.preview(self.preview_chars),
            files_used.join(", "),
            analysis_type
        ));

        let request =
            CompletionRequest::new(vec![system, user]).with_temperature(EXPLAIN_TEMPERATURE);
        ask_structured(self.llm.as_ref(), request, parse_explanation).await
    }
}

fn parse_explanation(value: &serde_json::Value) -> Result<Explanation, String> {
    let explanation = string_field(value, "explanation")?;
    if explanation.is_empty() {
        return Err("field `explanation` is empty".to_string());
    }
    let mut recommendations = string_list_field(value, "recommendations")?;
    recommendations.retain(|r| !r.is_empty());
    if recommendations.is_empty() {
        recommendations.push("Consider exploring related metrics".to_string());
    }
    Ok(Explanation {
        explanation,
        recommendations,
    })
}

fn is_empty_result(result: &ResultValue) -> bool {
    match result {
        ResultValue::Table(t) => t.records.is_empty(),
        ResultValue::List(items) => items.is_empty(),
        _ => false,
    }
}

/// Fixed explanation for a run that ended without a result
pub fn terminal_explanation(kind: FailureKind, attempts: u32, categories: &[String]) -> String {
    let plural = if attempts == 1 { "" } else { "s" };
    let cause = match kind {
        FailureKind::RetryBudgetExhausted => format!(
            "I could not produce safe, working analysis code after {} attempt{}.",
            attempts, plural
        ),
        FailureKind::TimeoutExceeded => {
            "The analysis took too long to run and was stopped.".to_string()
        }
        FailureKind::SchemaViolation => {
            "The language model returned an answer I could not interpret.".to_string()
        }
        FailureKind::ModelUnavailable => {
            "No language model was available to process the question.".to_string()
        }
        FailureKind::DatasetUnavailable => {
            "One of the selected files could not be loaded.".to_string()
        }
        FailureKind::SandboxUnavailable => {
            "The analysis environment could not be started.".to_string()
        }
        FailureKind::PolicyViolation | FailureKind::RuntimeFailure => {
            "The analysis could not be completed.".to_string()
        }
    };

    if categories.is_empty() {
        format!("I wasn't able to complete your analysis. {}", cause)
    } else {
        format!(
            "I wasn't able to complete your analysis. {} Problems encountered: {}.",
            cause,
            categories.join(", ")
        )
    }
}

pub fn fallback_recommendations() -> Vec<String> {
    FALLBACK_RECOMMENDATIONS.iter().map(|r| r.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::{Scalar, TabularResult};
    use serde_json::json;

    #[test]
    fn test_parse_explanation() {
        let e = parse_explanation(&json!({
            "explanation": "North leads with 200.",
            "recommendations": ["Focus on North", ""]
        }))
        .unwrap();
        assert_eq!(e.recommendations, vec!["Focus on North"]);

        let e = parse_explanation(&json!({"explanation": "x"})).unwrap();
        assert_eq!(e.recommendations, vec!["Consider exploring related metrics"]);

        assert!(parse_explanation(&json!({"explanation": ""})).is_err());
        assert!(parse_explanation(&json!({"recommendations": []})).is_err());
    }

    #[test]
    fn test_empty_results() {
        let empty = ResultValue::Table(TabularResult {
            columns: vec!["a".to_string()],
            records: Vec::new(),
        });
        assert!(is_empty_result(&empty));
        assert!(!is_empty_result(&ResultValue::Scalar(Scalar::Int(0))));
    }

    #[test]
    fn test_terminal_explanation_lists_categories() {
        let text = terminal_explanation(
            FailureKind::RetryBudgetExhausted,
            3,
            &["system_access".to_string(), "runtime_failure".to_string()],
        );
        assert!(text.contains("after 3 attempts"));
        assert!(text.contains("system_access, runtime_failure"));
        assert!(!text.contains("import"));
    }

    #[test]
    fn test_terminal_explanation_for_missing_sandbox() {
        let text = terminal_explanation(FailureKind::SandboxUnavailable, 1, &[]);
        assert!(text.contains("analysis environment could not be started"));
        assert!(!text.contains("Problems encountered"));
    }
}
