//! Analysis state and the values that flow through a run

use sdk::{DatasetDescriptor, ResultValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::sandbox::ExecutionOutcome;

/// What the question asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Aggregate,
    Compare,
    Query,
    Trend,
    Visualize,
}

impl Intent {
    pub const ALL: [Intent; 5] = [
        Intent::Aggregate,
        Intent::Compare,
        Intent::Query,
        Intent::Trend,
        Intent::Visualize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Aggregate => "aggregate",
            Intent::Compare => "compare",
            Intent::Query => "query",
            Intent::Trend => "trend",
            Intent::Visualize => "visualize",
        }
    }
}

impl FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Intent::ALL
            .into_iter()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| format!("unknown intent {:?}", s))
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many and which kind of datasets the question spans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    SingleTable,
    CrossTable,
    Temporal,
}

impl OperationType {
    pub const ALL: [OperationType; 3] = [
        OperationType::SingleTable,
        OperationType::CrossTable,
        OperationType::Temporal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::SingleTable => "single_table",
            OperationType::CrossTable => "cross_table",
            OperationType::Temporal => "temporal",
        }
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationType::ALL
            .into_iter()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| format!("unknown operation type {:?}", s))
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy status of the current candidate code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeValidity {
    #[default]
    Unknown,
    Valid,
    Rejected,
}

/// Pipeline nodes, in run order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    RetrieveContext,
    ClassifyIntent,
    Plan,
    GenerateCode,
    ValidateCode,
    ExecuteCode,
    Explain,
    AssembleResponse,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::RetrieveContext => "retrieve_context",
            Stage::ClassifyIntent => "classify_intent",
            Stage::Plan => "plan",
            Stage::GenerateCode => "generate_code",
            Stage::ValidateCode => "validate_code",
            Stage::ExecuteCode => "execute_code",
            Stage::Explain => "explain",
            Stage::AssembleResponse => "assemble_response",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Model output did not match the expected shape
    SchemaViolation,
    /// Code matched a policy rule
    PolicyViolation,
    /// The sandbox deadline expired
    TimeoutExceeded,
    /// The code raised or produced no `result`
    RuntimeFailure,
    /// Every generation attempt was rejected
    RetryBudgetExhausted,
    /// No language model answered
    ModelUnavailable,
    /// A dataset could not be loaded for execution
    DatasetUnavailable,
    /// The execution sandbox could not be reached
    SandboxUnavailable,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SchemaViolation => "schema_violation",
            FailureKind::PolicyViolation => "policy_violation",
            FailureKind::TimeoutExceeded => "timeout_exceeded",
            FailureKind::RuntimeFailure => "runtime_failure",
            FailureKind::RetryBudgetExhausted => "retry_budget_exhausted",
            FailureKind::ModelUnavailable => "model_unavailable",
            FailureKind::DatasetUnavailable => "dataset_unavailable",
            FailureKind::SandboxUnavailable => "sandbox_unavailable",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a run's error trail.
///
/// `detail` is a categorized description with secrets scrubbed, never a
/// raw internal error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub stage: Stage,
    /// Code-generation attempt the failure belongs to (1-based), 0 outside the loop
    pub attempt: u32,
    pub detail: String,
    /// Policy categories or error classes involved
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

impl FailureRecord {
    pub fn new(kind: FailureKind, stage: Stage, detail: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            attempt: 0,
            detail: crate::secrets::scrub_secrets(&detail.into()),
            categories: Vec::new(),
        }
    }

    pub fn at_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories;
        self
    }
}

/// Advisory analysis plan handed to the code generator
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub operations: Vec<String>,
    #[serde(default)]
    pub group_by: Option<Vec<String>>,
    #[serde(default)]
    pub filters: Option<serde_json::Value>,
    #[serde(default)]
    pub columns_to_use: Vec<String>,
    #[serde(default)]
    pub aggregations: Option<Vec<String>>,
    #[serde(default)]
    pub reasoning: String,
}

/// State of one run. Owned by the run and never shared.
#[derive(Debug, Clone)]
pub struct AnalysisState {
    pub session_id: String,
    pub user_query: String,
    pub available_files: Vec<DatasetDescriptor>,
    pub intent: Option<Intent>,
    pub operation_type: Option<OperationType>,
    /// Descriptor ids selected for this query
    pub files_to_use: Vec<String>,
    pub plan: Option<Plan>,
    pub generated_code: Option<String>,
    pub code_valid: CodeValidity,
    /// Feedback from the last rejected attempt, injected into the next prompt
    pub feedback: Vec<String>,
    pub execution_outcome: Option<ExecutionOutcome>,
    pub explanation: Option<String>,
    pub recommendations: Vec<String>,
    pub retry_count: u32,
    pub errors: Vec<FailureRecord>,
    pub node_history: Vec<Stage>,
}

/// Partial update returned by a stage. `Some` fields overwrite, the
/// vectors under `errors` and `node` append.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub node: Option<Stage>,
    pub intent: Option<Intent>,
    pub operation_type: Option<OperationType>,
    pub files_to_use: Option<Vec<String>>,
    pub plan: Option<Plan>,
    pub generated_code: Option<String>,
    pub code_valid: Option<CodeValidity>,
    pub feedback: Option<Vec<String>>,
    pub execution_outcome: Option<ExecutionOutcome>,
    /// Drop the previous outcome before `execution_outcome` is applied
    pub clear_outcome: bool,
    pub explanation: Option<String>,
    pub recommendations: Option<Vec<String>>,
    pub retry_count: Option<u32>,
    pub errors: Vec<FailureRecord>,
}

impl StatePatch {
    pub fn at(node: Stage) -> Self {
        Self {
            node: Some(node),
            ..Default::default()
        }
    }

    pub fn error(mut self, record: FailureRecord) -> Self {
        self.errors.push(record);
        self
    }
}

impl AnalysisState {
    pub fn new(
        session_id: impl Into<String>,
        user_query: impl Into<String>,
        available_files: Vec<DatasetDescriptor>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_query: user_query.into(),
            available_files,
            intent: None,
            operation_type: None,
            files_to_use: Vec::new(),
            plan: None,
            generated_code: None,
            code_valid: CodeValidity::Unknown,
            feedback: Vec::new(),
            execution_outcome: None,
            explanation: None,
            recommendations: Vec::new(),
            retry_count: 0,
            errors: Vec::new(),
            node_history: Vec::new(),
        }
    }

    /// Merge a stage's patch, last writer wins per field
    pub fn apply(&mut self, patch: StatePatch) {
        if let Some(node) = patch.node {
            self.node_history.push(node);
        }
        if let Some(v) = patch.intent {
            self.intent = Some(v);
        }
        if let Some(v) = patch.operation_type {
            self.operation_type = Some(v);
        }
        if let Some(v) = patch.files_to_use {
            self.files_to_use = v;
        }
        if let Some(v) = patch.plan {
            self.plan = Some(v);
        }
        if let Some(v) = patch.generated_code {
            self.generated_code = Some(v);
        }
        if let Some(v) = patch.code_valid {
            self.code_valid = v;
        }
        if let Some(v) = patch.feedback {
            self.feedback = v;
        }
        if patch.clear_outcome {
            self.execution_outcome = None;
        }
        if let Some(v) = patch.execution_outcome {
            self.execution_outcome = Some(v);
        }
        if let Some(v) = patch.explanation {
            self.explanation = Some(v);
        }
        if let Some(v) = patch.recommendations {
            self.recommendations = v;
        }
        if let Some(v) = patch.retry_count {
            self.retry_count = v;
        }
        self.errors.extend(patch.errors);
    }

    /// Descriptors selected for this query, in upload order
    pub fn selected_files(&self) -> Vec<&DatasetDescriptor> {
        self.available_files
            .iter()
            .filter(|f| self.files_to_use.contains(&f.id))
            .collect()
    }

    /// Names of the selected datasets
    pub fn files_used(&self) -> Vec<String> {
        self.selected_files().iter().map(|f| f.name.clone()).collect()
    }

    /// Code-generation attempt currently in progress (1-based)
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    /// Every distinct failure category seen so far, in order
    pub fn failure_categories(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for record in &self.errors {
            let names = if record.categories.is_empty() {
                vec![record.kind.as_str().to_string()]
            } else {
                record.categories.clone()
            };
            for name in names {
                if !seen.contains(&name) {
                    seen.push(name);
                }
            }
        }
        seen
    }

    pub fn result(&self) -> Option<&ResultValue> {
        self.execution_outcome.as_ref().and_then(ExecutionOutcome::result)
    }
}

/// What the caller receives for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub session_id: String,
    pub intent: Option<Intent>,
    pub operation_type: Option<OperationType>,
    pub files_used: Vec<String>,
    pub generated_code: Option<String>,
    pub result: Option<ResultValue>,
    pub explanation: String,
    pub recommendations: Vec<String>,
    /// Always present, possibly empty
    pub errors: Vec<FailureRecord>,
    pub retry_count: u32,
    pub cached: bool,
}

/// A run that ended without a usable answer.
///
/// `response` still carries an apologetic explanation and the error trail.
#[derive(Debug, Clone, thiserror::Error)]
#[error("analysis failed: {kind}")]
pub struct TerminalError {
    pub kind: FailureKind,
    pub response: FinalResult,
    /// Last candidate code, kept for the audit trail only
    pub attempted_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_vocabularies() {
        assert_eq!("aggregate".parse::<Intent>(), Ok(Intent::Aggregate));
        assert_eq!("cross_table".parse::<OperationType>(), Ok(OperationType::CrossTable));
        assert!("forecast".parse::<Intent>().is_err());
        assert!("Aggregate".parse::<Intent>().is_err());
        assert!("multi_table".parse::<OperationType>().is_err());
    }

    #[test]
    fn test_patch_is_last_writer_wins() {
        let mut state = AnalysisState::new("s1", "q", Vec::new());
        let mut first = StatePatch::at(Stage::GenerateCode);
        first.generated_code = Some("result = 1".to_string());
        first.code_valid = Some(CodeValidity::Rejected);
        state.apply(first);

        let mut second = StatePatch::at(Stage::GenerateCode);
        second.generated_code = Some("result = 2".to_string());
        state.apply(second);

        assert_eq!(state.generated_code.as_deref(), Some("result = 2"));
        assert_eq!(state.code_valid, CodeValidity::Rejected);
        assert_eq!(state.node_history, vec![Stage::GenerateCode, Stage::GenerateCode]);
    }

    #[test]
    fn test_new_attempt_clears_previous_outcome() {
        let mut state = AnalysisState::new("s1", "q", Vec::new());
        state.apply(StatePatch {
            execution_outcome: Some(ExecutionOutcome::failure(
                crate::sandbox::FailureKind::Runtime,
                "KeyError: 'Missing'",
            )),
            feedback: Some(vec!["runtime_failure: KeyError".to_string()]),
            ..StatePatch::at(Stage::ExecuteCode)
        });

        // A patch that leaves the outcome alone keeps it
        state.apply(StatePatch::at(Stage::ValidateCode));
        assert!(state.execution_outcome.is_some());

        state.apply(StatePatch {
            clear_outcome: true,
            feedback: Some(Vec::new()),
            ..StatePatch::at(Stage::GenerateCode)
        });
        assert!(state.execution_outcome.is_none());
        assert!(state.feedback.is_empty());
    }

    #[test]
    fn test_errors_append() {
        let mut state = AnalysisState::new("s1", "q", Vec::new());
        state.apply(StatePatch::at(Stage::ValidateCode).error(
            FailureRecord::new(FailureKind::PolicyViolation, Stage::ValidateCode, "x")
                .with_categories(vec!["system_access".to_string()]),
        ));
        state.apply(StatePatch::at(Stage::ExecuteCode).error(FailureRecord::new(
            FailureKind::RuntimeFailure,
            Stage::ExecuteCode,
            "KeyError",
        )));
        assert_eq!(state.errors.len(), 2);
        assert_eq!(
            state.failure_categories(),
            vec!["system_access".to_string(), "runtime_failure".to_string()]
        );
    }

    #[test]
    fn test_failure_detail_is_scrubbed() {
        let record = FailureRecord::new(
            FailureKind::ModelUnavailable,
            Stage::ClassifyIntent,
            "rejected key sk-abcdefghijklmnopqrstuvwxyz123456",
        );
        assert!(!record.detail.contains("sk-abcdef"));
    }
}
