//! Code Generator
//!
//! Asks the model for an analysis script. On a retry the prompt carries
//! the exact rejection reasons of the previous attempt.

use super::planner::describe_schemas;
use super::state::Plan;
use crate::llm::{extract_fenced_block, CompletionRequest, LLMError, LLMProvider, Message};
use sdk::DatasetDescriptor;
use std::sync::Arc;
use thiserror::Error;

/// Sample rows shown per file
const PROMPT_SAMPLE_ROWS: usize = 2;

const LANGUAGE_RULES: &str = "\
Write a short script in a Python/pandas subset. Rules:
1. The datasets are already loaded as DataFrames under the names listed below. \
Do not read or write files.
2. `pd` is available; do not import anything else. No os, sys, subprocess, eval or exec.
3. Supported: assignment, if/for/while, def, lambda, list comprehensions, f-strings, \
DataFrame indexing and boolean masks, groupby/agg, merge, concat, sort_values, \
head/tail, pivot_table, value_counts, the .str and .dt accessors.
4. Store the final answer in a variable called `result` (a DataFrame, Series, \
number, string, list or dict). Prefer reset_index() so grouped results keep \
their key columns.
5. Handle missing values gracefully.
Return ONLY the code in a ```python block.";

#[derive(Debug, Error)]
pub enum GenerationError {
    /// The reply contained no code
    #[error("model reply contained no code")]
    NoCode,

    #[error(transparent)]
    Transport(#[from] LLMError),
}

/// Everything the prompt is built from
pub struct GenerationContext<'a> {
    pub query: &'a str,
    pub files: Vec<&'a DatasetDescriptor>,
    pub plan: Option<&'a Plan>,
    /// Rejection reasons from the previous attempt
    pub feedback: &'a [String],
}

pub struct CodeGenerator {
    llm: Arc<dyn LLMProvider>,
}

impl CodeGenerator {
    pub fn new(llm: Arc<dyn LLMProvider>) -> Self {
        Self { llm }
    }

    pub async fn generate(&self, ctx: &GenerationContext<'_>) -> Result<String, GenerationError> {
        let request = CompletionRequest::new(build_messages(ctx));
        let reply = self.llm.generate(&request).await?;
        extract_code(&reply).ok_or(GenerationError::NoCode)
    }
}

fn build_messages(ctx: &GenerationContext<'_>) -> Vec<Message> {
    let mut bindings: Vec<String> = ctx
        .files
        .iter()
        .map(|f| match f.period_note() {
            Some(note) => format!("- `{}` ({} rows) {}", f.name, f.row_count, note),
            None => format!("- `{}` ({} rows)", f.name, f.row_count),
        })
        .collect();
    if ctx.files.len() == 1 {
        bindings.push("- `df` is the same table as above".to_string());
    }

    let samples: Vec<String> = ctx
        .files
        .iter()
        .map(|f| {
            let rows: Vec<_> = f.sample_rows.iter().take(PROMPT_SAMPLE_ROWS).collect();
            format!(
                "{}: {}",
                f.name,
                serde_json::to_string(&rows).unwrap_or_default()
            )
        })
        .collect();

    let plan = ctx
        .plan
        .map(|p| serde_json::to_string_pretty(p).unwrap_or_default())
        .unwrap_or_else(|| "(none)".to_string());

    let mut user = format!(
        "User query: {}\n\nLoaded datasets:\n{}\n\nSchemas:\n{}\n\nSample rows:\n{}\n\nAnalysis plan:\n{}",
        ctx.query,
        bindings.join("\n"),
        describe_schemas(&ctx.files),
        samples.join("\n"),
        plan
    );

    if !ctx.feedback.is_empty() {
        user.push_str(
            "\n\nYour previous script was rejected. Fix every problem listed here \
             and do not repeat any forbidden pattern, even in comments:\n",
        );
        for line in ctx.feedback {
            user.push_str("- ");
            user.push_str(line);
            user.push('\n');
        }
    }

    vec![Message::system(LANGUAGE_RULES), Message::user(user)]
}

/// Take the first fenced block, or the whole reply when there is none
pub fn extract_code(reply: &str) -> Option<String> {
    let code = if reply.contains("```") {
        extract_fenced_block(reply)?
    } else {
        reply
    };
    let code = code.trim();
    if code.is_empty() {
        None
    } else {
        Some(code.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use sdk::Scalar;

    fn descriptor() -> DatasetDescriptor {
        let mut row = IndexMap::new();
        row.insert("Group".to_string(), Scalar::Text("A".to_string()));
        row.insert("X".to_string(), Scalar::Int(100));
        DatasetDescriptor {
            id: "f1".to_string(),
            name: "sales".to_string(),
            columns: vec!["Group".to_string(), "X".to_string()],
            column_types: IndexMap::new(),
            sample_rows: vec![row.clone(), row.clone(), row],
            row_count: 3,
            version: "v1".to_string(),
            source: None,
            time_period: None,
            period_type: None,
        }
    }

    #[test]
    fn test_extract_code() {
        assert_eq!(
            extract_code("Here:\n```python\nresult = df.head()\n```\nDone").as_deref(),
            Some("result = df.head()")
        );
        assert_eq!(extract_code("result = 1\n").as_deref(), Some("result = 1"));
        assert_eq!(extract_code("```python\n```"), None);
        assert_eq!(extract_code("   "), None);
    }

    #[test]
    fn test_prompt_lists_bindings_and_samples() {
        let file = descriptor();
        let ctx = GenerationContext {
            query: "average X by Group",
            files: vec![&file],
            plan: None,
            feedback: &[],
        };
        let messages = build_messages(&ctx);
        let user = &messages[1].content;
        assert!(user.contains("`sales` (3 rows)"));
        assert!(user.contains("`df`"));
        assert!(user.contains(r#"{"Group":"A","X":100}"#));
        assert!(!user.contains("rejected"));
        // two sample rows only
        assert_eq!(user.matches(r#""Group":"A""#).count(), 2);
    }

    #[test]
    fn test_prompt_names_file_periods() {
        let mut nov = descriptor();
        nov.name = "sales_nov_2024".to_string();
        nov.time_period = Some("Nov 2024".to_string());
        nov.period_type = Some(sdk::PeriodType::Monthly);
        let mut dec = descriptor();
        dec.name = "sales_dec_2024".to_string();
        dec.time_period = Some("Dec 2024".to_string());
        dec.period_type = Some(sdk::PeriodType::Monthly);

        let ctx = GenerationContext {
            query: "compare November with December",
            files: vec![&nov, &dec],
            plan: None,
            feedback: &[],
        };
        let user = &build_messages(&ctx)[1].content;
        assert!(user.contains("`sales_nov_2024` (3 rows) Period: Nov 2024 (monthly)"));
        assert!(user.contains("`sales_dec_2024` (3 rows) Period: Dec 2024 (monthly)"));
        assert!(!user.contains("`df`"));
    }

    #[test]
    fn test_retry_prompt_carries_feedback() {
        let file = descriptor();
        let feedback = vec!["system_access: forbidden pattern \"import os\"".to_string()];
        let ctx = GenerationContext {
            query: "q",
            files: vec![&file],
            plan: None,
            feedback: &feedback,
        };
        let messages = build_messages(&ctx);
        assert!(messages[1].content.contains("forbidden pattern \"import os\""));
    }
}
