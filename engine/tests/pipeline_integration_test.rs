//! Integration tests for the analysis pipeline
//!
//! Runs the conductor end to end with a scripted language model and the
//! real sandbox worker (the `sift` binary in worker mode).

use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use sdk::{DatasetDescriptor, ResultValue, Scalar, Table};
use sift_engine::cache::ResultCache;
use sift_engine::conductor::{
    Conductor, ConductorSettings, FailureKind, Intent, OperationType, Stage,
};
use sift_engine::datasets::CsvDatasetProvider;
use sift_engine::llm::{CompletionRequest, LLMError, LLMProvider};
use sift_engine::policy::PolicyValidator;
use sift_engine::sandbox::{ExecutionOutcome, ProcessSandbox, Sandbox, WORKER_SUBCOMMAND};

const CLASSIFY_REPLY: &str = r#"{"intent": "aggregate", "operation_type": "single_table", "files_needed": ["sales.csv"], "reasoning": "average per group"}"#;
const PLAN_REPLY: &str = r#"{"operations": ["Group by Group", "Mean of X"], "group_by": ["Group"], "columns_to_use": ["Group", "X"], "aggregations": ["mean"], "reasoning": "simple"}"#;
const EXPLAIN_REPLY: &str = r#"{"explanation": "Both groups average 200.", "recommendations": ["Compare more groups"]}"#;
const GOOD_CODE: &str = "```python\nresult = df.groupby('Group')['X'].mean().reset_index()\n```";
/// Scripted reply that makes the provider fail once
const OUTAGE: &str = "<outage>";

/// Answers each stage from its own script, keyed by the system prompt
#[derive(Default)]
struct ScriptedLlm {
    classify: Mutex<VecDeque<String>>,
    plan: Mutex<VecDeque<String>>,
    code: Mutex<VecDeque<String>>,
    explain: Mutex<VecDeque<String>>,
    code_calls: AtomicUsize,
    calls: AtomicUsize,
    last_code_prompt: Mutex<String>,
}

impl ScriptedLlm {
    fn happy() -> Self {
        let llm = Self::default();
        llm.push_classify(CLASSIFY_REPLY);
        llm.push_plan(PLAN_REPLY);
        llm.push_code(GOOD_CODE);
        llm.push_explain(EXPLAIN_REPLY);
        llm
    }

    fn push_classify(&self, reply: &str) {
        self.classify.lock().unwrap().push_back(reply.to_string());
    }

    fn push_plan(&self, reply: &str) {
        self.plan.lock().unwrap().push_back(reply.to_string());
    }

    fn push_code(&self, reply: &str) {
        self.code.lock().unwrap().push_back(reply.to_string());
    }

    fn push_explain(&self, reply: &str) {
        self.explain.lock().unwrap().push_back(reply.to_string());
    }

    fn code_calls(&self) -> usize {
        self.code_calls.load(Ordering::SeqCst)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn next(queue: &Mutex<VecDeque<String>>) -> Result<String, LLMError> {
    let mut queue = queue.lock().unwrap();
    // The last reply repeats once the script runs out
    match queue.len() {
        0 => Err(LLMError::ProviderUnavailable("script exhausted".to_string())),
        1 => Ok(queue[0].clone()),
        _ => match queue.pop_front().unwrap() {
            reply if reply == OUTAGE => {
                Err(LLMError::ProviderUnavailable("scripted outage".to_string()))
            }
            reply => Ok(reply),
        },
    }
}

#[async_trait]
impl LLMProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn generate(&self, request: &CompletionRequest) -> Result<String, LLMError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let system = &request.messages[0].content;
        if system.contains("Classify the user's question") {
            next(&self.classify)
        } else if system.contains("data analysis planner") {
            next(&self.plan)
        } else if system.contains("Python/pandas subset") {
            self.code_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_code_prompt.lock().unwrap() = request.messages[1].content.clone();
            next(&self.code)
        } else {
            next(&self.explain)
        }
    }
}

/// Real worker process, counting executions
struct CountingSandbox {
    inner: ProcessSandbox,
    runs: AtomicUsize,
}

impl CountingSandbox {
    fn new() -> Self {
        Self::with_program(env!("CARGO_BIN_EXE_sift"))
    }

    fn with_program(program: &str) -> Self {
        Self {
            inner: ProcessSandbox::new(program, vec![WORKER_SUBCOMMAND.to_string()]),
            runs: AtomicUsize::new(0),
        }
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for CountingSandbox {
    async fn execute(
        &self,
        code: &str,
        datasets: &IndexMap<String, Table>,
        timeout: Duration,
    ) -> ExecutionOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(code, datasets, timeout).await
    }
}

struct Harness {
    _dir: TempDir,
    llm: Arc<ScriptedLlm>,
    sandbox: Arc<CountingSandbox>,
    conductor: Conductor,
    provider: CsvDatasetProvider,
    csv_path: std::path::PathBuf,
}

impl Harness {
    fn new(llm: ScriptedLlm, settings: ConductorSettings, cache: Option<ResultCache>) -> Self {
        Self::with_sandbox(llm, settings, cache, CountingSandbox::new())
    }

    fn with_sandbox(
        llm: ScriptedLlm,
        settings: ConductorSettings,
        cache: Option<ResultCache>,
        sandbox: CountingSandbox,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let csv_path = dir.path().join("sales.csv");
        std::fs::write(&csv_path, "Group,X\nA,100\nB,200\nA,300\n").unwrap();

        let llm = Arc::new(llm);
        let sandbox = Arc::new(sandbox);
        let mut conductor = Conductor::new(
            Arc::clone(&llm) as Arc<dyn LLMProvider>,
            PolicyValidator::new().unwrap(),
            Arc::clone(&sandbox) as Arc<dyn Sandbox>,
            Arc::new(CsvDatasetProvider::default()),
            settings,
        );
        if let Some(cache) = cache {
            conductor = conductor.with_cache(cache);
        }

        Self {
            _dir: dir,
            llm,
            sandbox,
            conductor,
            provider: CsvDatasetProvider::default(),
            csv_path,
        }
    }

    async fn files(&self) -> Vec<DatasetDescriptor> {
        vec![describe(&self.provider, &self.csv_path).await]
    }
}

async fn describe(provider: &CsvDatasetProvider, path: &Path) -> DatasetDescriptor {
    provider.describe_path(path, Some("file-1")).await.unwrap()
}

fn settings() -> ConductorSettings {
    ConductorSettings {
        max_retries: 2,
        sandbox_timeout: Duration::from_secs(10),
        preview_chars: 3000,
    }
}

fn cache() -> ResultCache {
    ResultCache::in_memory(100, Duration::from_secs(600))
}

#[tokio::test]
async fn test_average_by_group_end_to_end() {
    let harness = Harness::new(ScriptedLlm::happy(), settings(), None);
    let response = harness
        .conductor
        .run("average X by group", "session-1", harness.files().await)
        .await
        .unwrap();

    assert_eq!(response.intent, Some(Intent::Aggregate));
    assert_eq!(response.operation_type, Some(OperationType::SingleTable));
    assert_eq!(response.files_used, vec!["sales"]);
    assert_eq!(response.retry_count, 0);
    assert!(response.errors.is_empty());
    assert!(!response.cached);
    assert_eq!(response.explanation, "Both groups average 200.");

    let Some(ResultValue::Table(table)) = response.result else {
        panic!("expected a table result");
    };
    assert_eq!(table.columns, vec!["Group", "X"]);
    assert_eq!(table.records.len(), 2);
    assert_eq!(table.records[0]["Group"], Scalar::Text("A".to_string()));
    assert_eq!(table.records[0]["X"], Scalar::Float(200.0));
    assert_eq!(table.records[1]["Group"], Scalar::Text("B".to_string()));
    assert_eq!(table.records[1]["X"], Scalar::Float(200.0));
    // Key set equals the column set, in column order
    let keys: Vec<&String> = table.records[0].keys().collect();
    assert_eq!(keys, vec!["Group", "X"]);
}

#[tokio::test]
async fn test_repeated_question_is_served_from_cache() {
    let harness = Harness::new(ScriptedLlm::happy(), settings(), Some(cache()));
    let files = harness.files().await;

    let first = harness
        .conductor
        .run("Average X by group", "session-1", files.clone())
        .await
        .unwrap();
    let code_calls = harness.llm.code_calls();
    let model_calls = harness.llm.calls();
    assert_eq!(harness.sandbox.runs(), 1);

    let second = harness
        .conductor
        .run("  average x   BY group ", "session-1", files)
        .await
        .unwrap();

    assert!(second.cached);
    assert_eq!(second.result, first.result);
    assert_eq!(second.explanation, first.explanation);
    assert_eq!(harness.llm.code_calls(), code_calls);
    assert_eq!(harness.llm.calls(), model_calls);
    assert_eq!(harness.sandbox.runs(), 1);
}

#[tokio::test]
async fn test_changed_file_content_invalidates_cache() {
    let harness = Harness::new(ScriptedLlm::happy(), settings(), Some(cache()));
    harness
        .conductor
        .run("average X by group", "session-1", harness.files().await)
        .await
        .unwrap();

    // Re-upload under the same name with different content
    std::fs::write(&harness.csv_path, "Group,X\nA,1\nB,2\n").unwrap();
    let response = harness
        .conductor
        .run("average X by group", "session-1", harness.files().await)
        .await
        .unwrap();

    assert!(!response.cached);
    assert_eq!(harness.llm.code_calls(), 2);
    assert_eq!(harness.sandbox.runs(), 2);
    let Some(ResultValue::Table(table)) = response.result else {
        panic!("expected a table result");
    };
    assert_eq!(table.records[0]["X"], Scalar::Float(1.0));
}

#[tokio::test]
async fn test_other_session_misses_cache() {
    let harness = Harness::new(ScriptedLlm::happy(), settings(), Some(cache()));
    let files = harness.files().await;
    harness.conductor.run("q", "session-1", files.clone()).await.unwrap();
    let other = harness.conductor.run("q", "session-2", files).await.unwrap();
    assert!(!other.cached);
}

#[tokio::test]
async fn test_policy_violation_triggers_one_retry() {
    let llm = ScriptedLlm::happy();
    llm.code.lock().unwrap().clear();
    llm.push_code("```python\nimport os\nresult = df\n```");
    llm.push_code(GOOD_CODE);

    let harness = Harness::new(llm, settings(), None);
    let response = harness
        .conductor
        .run("average X by group", "session-1", harness.files().await)
        .await
        .unwrap();

    assert_eq!(response.retry_count, 1);
    assert_eq!(harness.llm.code_calls(), 2);
    assert_eq!(harness.sandbox.runs(), 1);
    assert!(response.result.is_some());

    let violation = &response.errors[0];
    assert_eq!(violation.kind, FailureKind::PolicyViolation);
    assert_eq!(violation.attempt, 1);
    assert!(violation.categories.contains(&"system_access".to_string()));

    // The second prompt carried the rejection reasons
    let prompt = harness.llm.last_code_prompt.lock().unwrap().clone();
    assert!(prompt.contains("forbidden pattern \"import os\""));
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let llm = ScriptedLlm::happy();
    llm.code.lock().unwrap().clear();
    llm.push_code("```python\nimport subprocess\nresult = 1\n```");
    llm.push_code("```python\nresult = eval('1 + 1')\n```");
    llm.push_code("```python\ndf.to_csv('out.csv')\nresult = 1\n```");

    let harness = Harness::new(llm, settings(), Some(cache()));
    let files = harness.files().await;
    let err = harness
        .conductor
        .run("average X by group", "session-1", files.clone())
        .await
        .unwrap_err();

    assert_eq!(err.kind, FailureKind::RetryBudgetExhausted);
    assert_eq!(harness.llm.code_calls(), 3);
    assert_eq!(harness.sandbox.runs(), 0);

    let response = &err.response;
    assert!(response.result.is_none());
    assert!(response.generated_code.is_none());
    assert!(!response.explanation.is_empty());
    assert!(!response.explanation.contains("subprocess"));
    assert_eq!(response.retry_count, 2);
    for category in ["system_access", "dynamic_evaluation", "destructive_mutation"] {
        assert!(
            response.explanation.contains(category),
            "explanation should list {}",
            category
        );
    }
    let last = response.errors.last().unwrap();
    assert_eq!(last.kind, FailureKind::RetryBudgetExhausted);
    assert!(last.categories.contains(&"dynamic_evaluation".to_string()));

    // The audit trail keeps the last candidate
    assert!(err.attempted_code.unwrap().contains("to_csv"));

    // Failures are never cached
    let again = harness
        .conductor
        .run("average X by group", "session-1", files)
        .await
        .unwrap_err();
    assert!(!again.response.cached);
}

#[tokio::test]
async fn test_runtime_failure_is_retried() {
    let llm = ScriptedLlm::happy();
    llm.code.lock().unwrap().clear();
    llm.push_code("```python\nresult = df['Missing'].sum()\n```");
    llm.push_code(GOOD_CODE);

    let harness = Harness::new(llm, settings(), None);
    let response = harness
        .conductor
        .run("average X by group", "session-1", harness.files().await)
        .await
        .unwrap();

    assert_eq!(response.retry_count, 1);
    assert_eq!(harness.sandbox.runs(), 2);
    assert_eq!(response.errors[0].kind, FailureKind::RuntimeFailure);
    assert_eq!(response.errors[0].stage, Stage::ExecuteCode);

    let prompt = harness.llm.last_code_prompt.lock().unwrap().clone();
    assert!(prompt.contains("runtime_failure"));
}

#[tokio::test]
async fn test_outage_after_runtime_failure_drops_stale_feedback() {
    let llm = ScriptedLlm::happy();
    llm.code.lock().unwrap().clear();
    llm.push_code("```python\nresult = df['Missing'].sum()\n```");
    llm.push_code(OUTAGE);
    llm.push_code(GOOD_CODE);

    let harness = Harness::new(llm, settings(), None);
    let response = harness
        .conductor
        .run("average X by group", "session-1", harness.files().await)
        .await
        .unwrap();

    assert_eq!(response.retry_count, 2);
    assert_eq!(harness.llm.code_calls(), 3);
    assert_eq!(harness.sandbox.runs(), 2);
    let kinds: Vec<FailureKind> = response.errors.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![FailureKind::RuntimeFailure, FailureKind::ModelUnavailable]
    );

    // The third attempt is not told about the first attempt's KeyError
    let prompt = harness.llm.last_code_prompt.lock().unwrap().clone();
    assert!(!prompt.contains("runtime_failure"), "{}", prompt);
    assert!(response.result.is_some());
}

#[tokio::test]
async fn test_missing_result_binding_counts_as_runtime_failure() {
    let llm = ScriptedLlm::happy();
    llm.code.lock().unwrap().clear();
    // Mentions `result` only in a string, so the policy lets it through
    llm.push_code("```python\ntotal = df['X'].sum()\nprint('result pending')\n```");
    llm.push_code(GOOD_CODE);

    let harness = Harness::new(llm, settings(), None);
    let response = harness
        .conductor
        .run("average X by group", "session-1", harness.files().await)
        .await
        .unwrap();

    assert_eq!(response.retry_count, 1);
    assert_eq!(response.errors[0].kind, FailureKind::RuntimeFailure);
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let llm = ScriptedLlm::happy();
    llm.code.lock().unwrap().clear();
    llm.push_code("```python\nwhile True:\n    x = 1\nresult = 1\n```");

    let timeout = Duration::from_secs(1);
    let harness = Harness::new(
        llm,
        ConductorSettings {
            sandbox_timeout: timeout,
            ..settings()
        },
        None,
    );

    let started = Instant::now();
    let err = harness
        .conductor
        .run("loop forever", "session-1", harness.files().await)
        .await
        .unwrap_err();

    assert_eq!(err.kind, FailureKind::TimeoutExceeded);
    assert!(started.elapsed() < timeout + Duration::from_secs(10));
    // Terminal: no further generation
    assert_eq!(harness.llm.code_calls(), 1);
    assert!(err.response.result.is_none());
}

#[tokio::test]
async fn test_malformed_classification_is_terminal_after_one_re_ask() {
    let llm = ScriptedLlm::happy();
    llm.classify.lock().unwrap().clear();
    llm.push_classify(r#"{"intent": "forecast", "operation_type": "single_table"}"#);

    let harness = Harness::new(llm, settings(), None);
    let err = harness
        .conductor
        .run("forecast X", "session-1", harness.files().await)
        .await
        .unwrap_err();

    assert_eq!(err.kind, FailureKind::SchemaViolation);
    assert_eq!(harness.llm.calls(), 2);
    assert_eq!(harness.llm.code_calls(), 0);
    assert_eq!(err.response.errors[0].stage, Stage::ClassifyIntent);
}

#[tokio::test]
async fn test_unusable_plan_falls_back_to_default() {
    let llm = ScriptedLlm::happy();
    llm.plan.lock().unwrap().clear();
    llm.push_plan("I would group the data and then average it.");

    let harness = Harness::new(llm, settings(), None);
    let response = harness
        .conductor
        .run("average X by group", "session-1", harness.files().await)
        .await
        .unwrap();

    assert!(response.result.is_some());
    assert_eq!(response.retry_count, 0);
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].kind, FailureKind::SchemaViolation);
    assert_eq!(response.errors[0].stage, Stage::Plan);

    let prompt = harness.llm.last_code_prompt.lock().unwrap().clone();
    assert!(prompt.contains("Perform basic analysis"));
}

#[tokio::test]
async fn test_model_outage_is_terminal() {
    let harness = Harness::new(ScriptedLlm::default(), settings(), None);
    let err = harness
        .conductor
        .run("average X by group", "session-1", harness.files().await)
        .await
        .unwrap_err();

    assert_eq!(err.kind, FailureKind::ModelUnavailable);
    assert!(!err.response.errors[0].detail.contains("script exhausted"));
}

#[tokio::test]
async fn test_deleted_dataset_is_reported() {
    let harness = Harness::new(ScriptedLlm::happy(), settings(), None);
    let files = harness.files().await;
    std::fs::remove_file(&harness.csv_path).unwrap();

    let err = harness
        .conductor
        .run("average X by group", "session-1", files)
        .await
        .unwrap_err();

    assert_eq!(err.kind, FailureKind::DatasetUnavailable);
    assert_eq!(harness.llm.code_calls(), 0);
}

#[tokio::test]
async fn test_missing_worker_ends_the_run() {
    let harness = Harness::with_sandbox(
        ScriptedLlm::happy(),
        settings(),
        Some(cache()),
        CountingSandbox::with_program("/nonexistent/sift-worker"),
    );
    let err = harness
        .conductor
        .run("average X by group", "session-1", harness.files().await)
        .await
        .unwrap_err();

    assert_eq!(err.kind, FailureKind::SandboxUnavailable);
    // No regeneration once the worker is known to be missing
    assert_eq!(harness.llm.code_calls(), 1);
    assert_eq!(harness.sandbox.runs(), 1);
    assert_eq!(err.response.retry_count, 0);

    let record = err.response.errors.last().unwrap();
    assert_eq!(record.kind, FailureKind::SandboxUnavailable);
    assert_eq!(record.stage, Stage::ExecuteCode);
    assert_eq!(record.detail, "sandbox worker unavailable");
    for record in &err.response.errors {
        assert!(!record.detail.contains("nonexistent"), "{}", record.detail);
        assert!(!record.detail.contains("os error"), "{}", record.detail);
    }
    assert!(err
        .response
        .explanation
        .contains("analysis environment could not be started"));
}
