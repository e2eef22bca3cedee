//! Intent classification
//!
//! Asks the model what kind of analysis the question wants, across which
//! files. Output outside the closed vocabularies is a schema violation.

use super::state::{Intent, OperationType};
use super::structured::{ask_structured, string_field, string_list_field, StructuredError};
use crate::llm::{CompletionRequest, LLMProvider, Message};
use sdk::DatasetDescriptor;
use std::sync::Arc;

/// Parsed classifier output
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    pub operation_type: OperationType,
    /// Files the model named, as given (id, binding name or file name)
    pub files_needed: Vec<String>,
    pub reasoning: String,
}

pub struct IntentClassifier {
    llm: Arc<dyn LLMProvider>,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LLMProvider>) -> Self {
        Self { llm }
    }

    pub async fn classify(
        &self,
        query: &str,
        files: &[DatasetDescriptor],
    ) -> Result<Classification, StructuredError> {
        let request = CompletionRequest::new(vec![
            Message::system(Self::system_prompt()),
            Message::user(format!(
                "Available files:\n{}\n\nUser query: {}",
                describe_files(files),
                query
            )),
        ]);
        ask_structured(self.llm.as_ref(), request, Self::parse).await
    }

    fn system_prompt() -> String {
        let intents: Vec<&str> = Intent::ALL.iter().map(Intent::as_str).collect();
        let operations: Vec<&str> = OperationType::ALL.iter().map(OperationType::as_str).collect();
        format!(
            "You are a data analysis assistant. Classify the user's question.\n\
             - intent: what the user wants, exactly one of: {intents}\n\
             - operation_type: one of: {operations} (single_table = one file, \
               cross_table = several files, temporal = comparison across time periods)\n\
             - files_needed: the files relevant to the question, by name\n\
             - reasoning: one sentence\n\n\
             Respond with a JSON object:\n\
             {{\"intent\": \"...\", \"operation_type\": \"...\", \"files_needed\": [\"...\"], \"reasoning\": \"...\"}}",
            intents = intents.join(", "),
            operations = operations.join(", "),
        )
    }

    /// Validate a classifier reply against the closed vocabularies
    pub fn parse(value: &serde_json::Value) -> Result<Classification, String> {
        let intent = string_field(value, "intent")?
            .to_ascii_lowercase()
            .parse::<Intent>()?;
        let operation_type = string_field(value, "operation_type")?
            .to_ascii_lowercase()
            .parse::<OperationType>()?;
        Ok(Classification {
            intent,
            operation_type,
            files_needed: string_list_field(value, "files_needed")?,
            reasoning: value
                .get("reasoning")
                .and_then(|r| r.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// One line per file: name, size and leading columns
pub(crate) fn describe_files(files: &[DatasetDescriptor]) -> String {
    files
        .iter()
        .map(|f| {
            let mut columns: Vec<&str> = f.columns.iter().take(8).map(String::as_str).collect();
            if f.columns.len() > columns.len() {
                columns.push("...");
            }
            let mut line = format!(
                "- {} ({} rows) columns: {}",
                f.name,
                f.row_count,
                columns.join(", ")
            );
            if let Some(note) = f.period_note() {
                line.push_str("; ");
                line.push_str(&note);
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Map the model's file references onto descriptor ids.
///
/// References may be ids, binding names or source file names. Unknown
/// references are dropped; when nothing remains every file is used.
pub fn select_files(files: &[DatasetDescriptor], needed: &[String]) -> Vec<String> {
    let matches = |f: &DatasetDescriptor, reference: &str| {
        let reference = reference.trim();
        f.id == reference
            || f.name == reference
            || f
                .source
                .as_ref()
                .and_then(|p| p.file_name())
                .is_some_and(|n| n.to_string_lossy() == reference)
    };

    let selected: Vec<String> = files
        .iter()
        .filter(|f| needed.iter().any(|r| matches(f, r)))
        .map(|f| f.id.clone())
        .collect();

    if selected.is_empty() {
        files.iter().map(|f| f.id.clone()).collect()
    } else {
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serde_json::json;
    use std::path::PathBuf;

    fn descriptor(id: &str, name: &str) -> DatasetDescriptor {
        DatasetDescriptor {
            id: id.to_string(),
            name: name.to_string(),
            columns: vec!["Region".to_string()],
            column_types: IndexMap::new(),
            sample_rows: Vec::new(),
            row_count: 3,
            version: "v1".to_string(),
            source: Some(PathBuf::from(format!("/data/{}.csv", name))),
            time_period: None,
            period_type: None,
        }
    }

    #[test]
    fn test_parse_valid_reply() {
        let c = IntentClassifier::parse(&json!({
            "intent": "Aggregate",
            "operation_type": "single_table",
            "files_needed": ["sales.csv"],
            "reasoning": "average by group"
        }))
        .unwrap();
        assert_eq!(c.intent, Intent::Aggregate);
        assert_eq!(c.operation_type, OperationType::SingleTable);
        assert_eq!(c.files_needed, vec!["sales.csv"]);
    }

    #[test]
    fn test_out_of_vocabulary_is_rejected() {
        let err = IntentClassifier::parse(&json!({
            "intent": "forecast",
            "operation_type": "single_table"
        }))
        .unwrap_err();
        assert!(err.contains("forecast"));
        assert!(IntentClassifier::parse(&json!({"intent": "query"})).is_err());
    }

    #[test]
    fn test_select_files_by_any_reference() {
        let files = vec![descriptor("f1", "sales"), descriptor("f2", "costs")];
        assert_eq!(select_files(&files, &["costs.csv".to_string()]), vec!["f2"]);
        assert_eq!(select_files(&files, &["sales".to_string()]), vec!["f1"]);
        assert_eq!(
            select_files(&files, &["f2".to_string(), "f1".to_string()]),
            vec!["f1", "f2"]
        );
    }

    #[test]
    fn test_file_list_mentions_detected_period() {
        let mut q1 = descriptor("f1", "sales_q1_2025");
        q1.time_period = Some("Q1 2025".to_string());
        q1.period_type = Some(sdk::PeriodType::Quarterly);
        let text = describe_files(&[q1, descriptor("f2", "costs")]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "- sales_q1_2025 (3 rows) columns: Region; Period: Q1 2025 (quarterly)"
        );
        assert!(!lines[1].contains("Period"));
    }

    #[test]
    fn test_unknown_files_fall_back_to_all() {
        let files = vec![descriptor("f1", "sales"), descriptor("f2", "costs")];
        assert_eq!(select_files(&files, &["nope.csv".to_string()]), vec!["f1", "f2"]);
        assert_eq!(select_files(&files, &[]), vec!["f1", "f2"]);
    }
}
