//! Analysis Planner
//!
//! Produces an advisory step list for the code generator. The plan is
//! never required: when the model's answer is unusable the caller falls
//! back to `default_plan`.

use super::state::{Intent, OperationType, Plan};
use super::structured::{ask_json, string_list_field, StructuredError};
use crate::llm::{CompletionRequest, LLMProvider, Message};
use sdk::{ColumnType, DatasetDescriptor};
use std::sync::Arc;

pub struct Planner {
    llm: Arc<dyn LLMProvider>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LLMProvider>) -> Self {
        Self { llm }
    }

    /// Ask the model for a plan
    pub async fn generate_plan(
        &self,
        query: &str,
        intent: Intent,
        operation_type: OperationType,
        files: &[&DatasetDescriptor],
    ) -> Result<Plan, StructuredError> {
        let system = Message::system(
            "You are a data analysis planner. Create a step-by-step plan for answering \
             the question. Consider which columns to use, grouping, filtering, how to \
             combine several files and which calculations to perform.\n\
             Respond with a JSON object:\n\
             {\"operations\": [\"Step 1: ...\", \"Step 2: ...\"], \
             \"group_by\": [\"column\"] or null, \
             \"filters\": {\"column\": \"value\"} or null, \
             \"columns_to_use\": [\"column\"], \
             \"aggregations\": [\"mean\"] or null, \
             \"reasoning\": \"...\"}",
        );
        let user = Message::user(format!(
            "User query: {}\nIntent: {}\nOperation type: {}\n\nFile schemas:\n{}",
            query,
            intent,
            operation_type,
            describe_schemas(files)
        ));

        let request = CompletionRequest::new(vec![system, user]);
        ask_json(self.llm.as_ref(), &request, parse_plan).await
    }

    /// Plan used when the model's plan is unusable
    pub fn default_plan(operation_type: Option<OperationType>) -> Plan {
        Plan {
            operations: vec!["Load data".to_string(), "Perform basic analysis".to_string()],
            reasoning: match operation_type {
                Some(OperationType::CrossTable) | Some(OperationType::Temporal) => {
                    "Default plan; data from several files may need aligning".to_string()
                }
                _ => "Default plan".to_string(),
            },
            ..Default::default()
        }
    }
}

fn parse_plan(value: &serde_json::Value) -> Result<Plan, String> {
    let operations = string_list_field(value, "operations")?;
    if operations.is_empty() {
        return Err("field `operations` must list at least one step".to_string());
    }
    let optional_list = |key: &str| -> Result<Option<Vec<String>>, String> {
        let list = string_list_field(value, key)?;
        Ok(if list.is_empty() { None } else { Some(list) })
    };
    Ok(Plan {
        operations,
        group_by: optional_list("group_by")?,
        filters: value.get("filters").filter(|f| !f.is_null()).cloned(),
        columns_to_use: string_list_field(value, "columns_to_use")?,
        aggregations: optional_list("aggregations")?,
        reasoning: value
            .get("reasoning")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string(),
    })
}

/// Column listing per file, grouped by inferred type
pub(crate) fn describe_schemas(files: &[&DatasetDescriptor]) -> String {
    files
        .iter()
        .map(|f| {
            let group = |t: ColumnType| f.columns_of_type(t).join(", ");
            format!(
                "{} ({} rows)\n  numeric: {}\n  categorical: {}\n  date: {}",
                f.name,
                f.row_count,
                group(ColumnType::Numeric),
                group(ColumnType::Categorical),
                group(ColumnType::Date)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_plan_full() {
        let plan = parse_plan(&json!({
            "operations": ["Step 1: group by Region", "Step 2: mean of Sales"],
            "group_by": ["Region"],
            "filters": null,
            "columns_to_use": ["Region", "Sales"],
            "aggregations": ["mean"],
            "reasoning": "average per region"
        }))
        .unwrap();
        assert_eq!(plan.operations.len(), 2);
        assert_eq!(plan.group_by, Some(vec!["Region".to_string()]));
        assert_eq!(plan.filters, None);
        assert_eq!(plan.aggregations, Some(vec!["mean".to_string()]));
    }

    #[test]
    fn test_parse_plan_minimal() {
        let plan = parse_plan(&json!({"operations": ["Load data"]})).unwrap();
        assert_eq!(plan.group_by, None);
        assert!(plan.columns_to_use.is_empty());
    }

    #[test]
    fn test_parse_plan_rejects_missing_steps() {
        assert!(parse_plan(&json!({"reasoning": "none"})).is_err());
        assert!(parse_plan(&json!({"operations": "Load data"})).is_err());
    }

    #[test]
    fn test_default_plan() {
        let plan = Planner::default_plan(Some(OperationType::SingleTable));
        assert_eq!(plan.operations, vec!["Load data", "Perform basic analysis"]);
        assert_eq!(plan.reasoning, "Default plan");
        let cross = Planner::default_plan(Some(OperationType::CrossTable));
        assert!(cross.reasoning.contains("aligning"));
    }
}
