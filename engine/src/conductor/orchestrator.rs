//! Pipeline orchestration
//!
//! Drives one `AnalysisState` through the fixed stage order. Every stage
//! reads the state and hands back a `StatePatch`; only `run` mutates the
//! state. A stage that must end the run returns a `Halt` carrying its
//! final patch.

use super::classifier::{select_files, IntentClassifier};
use super::explainer::{fallback_recommendations, terminal_explanation, Explainer};
use super::generator::{CodeGenerator, GenerationContext, GenerationError};
use super::planner::Planner;
use super::route::{route, Route};
use super::state::{
    AnalysisState, CodeValidity, FailureKind, FailureRecord, FinalResult, Stage, StatePatch,
    TerminalError,
};
use super::structured::StructuredError;
use crate::cache::{CachedRun, Fingerprint, ResultCache};
use crate::config::PipelineConfig;
use crate::datasets::DatasetProvider;
use crate::llm::LLMProvider;
use crate::policy::PolicyValidator;
use crate::sandbox::{ExecutionOutcome, FailureKind as ExecFailure, Sandbox};
use indexmap::IndexMap;
use sdk::{DatasetDescriptor, Table};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Detail recorded when no provider answered. The raw error is only logged.
const MODEL_UNAVAILABLE_DETAIL: &str = "no language model provider answered";

const SANDBOX_UNAVAILABLE_DETAIL: &str = "sandbox worker unavailable";

/// Tunables for a conductor
#[derive(Debug, Clone)]
pub struct ConductorSettings {
    pub max_retries: u32,
    pub sandbox_timeout: Duration,
    pub preview_chars: usize,
}

impl Default for ConductorSettings {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl ConductorSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            sandbox_timeout: config.sandbox_timeout(),
            preview_chars: config.result_preview_chars,
        }
    }
}

/// A stage ended the run
struct Halt {
    kind: FailureKind,
    patch: StatePatch,
}

impl Halt {
    /// Map a structured-call failure to its terminal kind
    fn structured(mut patch: StatePatch, stage: Stage, error: StructuredError) -> Self {
        let (kind, detail) = match error {
            StructuredError::Schema(reason) => (
                FailureKind::SchemaViolation,
                format!("malformed {} output: {}", stage, reason),
            ),
            StructuredError::Transport(e) => {
                warn!("{} failed: {}", stage, e);
                (FailureKind::ModelUnavailable, MODEL_UNAVAILABLE_DETAIL.to_string())
            }
        };
        patch.errors.push(FailureRecord::new(kind, stage, detail));
        Self { kind, patch }
    }
}

pub struct Conductor {
    classifier: IntentClassifier,
    planner: Planner,
    generator: CodeGenerator,
    explainer: Explainer,
    policy: PolicyValidator,
    sandbox: Arc<dyn Sandbox>,
    datasets: Arc<dyn DatasetProvider>,
    cache: Option<ResultCache>,
    settings: ConductorSettings,
}

impl Conductor {
    pub fn new(
        llm: Arc<dyn LLMProvider>,
        policy: PolicyValidator,
        sandbox: Arc<dyn Sandbox>,
        datasets: Arc<dyn DatasetProvider>,
        settings: ConductorSettings,
    ) -> Self {
        Self {
            classifier: IntentClassifier::new(Arc::clone(&llm)),
            planner: Planner::new(Arc::clone(&llm)),
            generator: CodeGenerator::new(Arc::clone(&llm)),
            explainer: Explainer::new(llm, settings.preview_chars),
            policy,
            sandbox,
            datasets,
            cache: None,
            settings,
        }
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn settings(&self) -> &ConductorSettings {
        &self.settings
    }

    /// Answer one question over the given files.
    ///
    /// Never panics on stage failures: every problem ends up either in
    /// `FinalResult::errors` or in a `TerminalError`.
    pub async fn run(
        &self,
        query: &str,
        session_id: &str,
        available_files: Vec<DatasetDescriptor>,
    ) -> Result<FinalResult, TerminalError> {
        let started = Instant::now();
        let mut state = AnalysisState::new(session_id, query, available_files);
        info!(
            "Run started for session {} over {} file(s)",
            session_id,
            state.available_files.len()
        );
        state.apply(StatePatch::at(Stage::Ingest));

        let fingerprint = Fingerprint::compute(session_id, query, &state.available_files);
        state.apply(StatePatch::at(Stage::RetrieveContext));
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&fingerprint).await {
                info!("Run served from cache in {:?}", started.elapsed());
                return Ok(Self::from_cache(&state, hit));
            }
        }

        match self.classify_intent(&state).await {
            Ok(patch) => state.apply(patch),
            Err(halt) => return Err(self.halt(state, halt)),
        }

        let patch = self.plan(&state).await;
        state.apply(patch);

        let tables = match self.load_datasets(&state).await {
            Ok(tables) => tables,
            Err(halt) => return Err(self.halt(state, halt)),
        };

        loop {
            let patch = self.generate_code(&state).await;
            state.apply(patch);
            if state.code_valid == CodeValidity::Unknown {
                let patch = self.validate_code(&state);
                state.apply(patch);
            }

            if route(state.code_valid, state.retry_count, self.settings.max_retries)
                == Route::Execute
            {
                match self.execute_code(&state, &tables).await {
                    Ok(patch) => state.apply(patch),
                    Err(halt) => return Err(self.halt(state, halt)),
                }
                if state.result().is_some() {
                    break;
                }
            }

            // The candidate was rejected, either by the gate or at runtime
            match route(state.code_valid, state.retry_count, self.settings.max_retries) {
                Route::Retry => {
                    debug!("Retrying generation (retry {})", state.retry_count + 1);
                    state.apply(StatePatch {
                        retry_count: Some(state.retry_count + 1),
                        ..Default::default()
                    });
                }
                Route::Abort | Route::Execute => {
                    let categories = state.failure_categories();
                    let record = FailureRecord::new(
                        FailureKind::RetryBudgetExhausted,
                        Stage::ValidateCode,
                        format!("no usable code after {} attempt(s)", state.attempt()),
                    )
                    .at_attempt(state.attempt())
                    .with_categories(categories);
                    state.apply(StatePatch::default().error(record));
                    return Err(self.terminate(state, FailureKind::RetryBudgetExhausted));
                }
            }
        }

        match self.explain(&state).await {
            Ok(patch) => state.apply(patch),
            Err(halt) => return Err(self.halt(state, halt)),
        }

        state.apply(StatePatch::at(Stage::AssembleResponse));
        let response = Self::assemble(&state);

        if let (Some(cache), Some(result)) = (&self.cache, &response.result) {
            let run = CachedRun {
                intent: response.intent,
                operation_type: response.operation_type,
                files_used: response.files_used.clone(),
                generated_code: response.generated_code.clone(),
                result: result.clone(),
                explanation: response.explanation.clone(),
                recommendations: response.recommendations.clone(),
            };
            cache.put(&fingerprint, &run).await;
        }

        info!(
            "Run finished in {:?} after {} attempt(s)",
            started.elapsed(),
            state.attempt()
        );
        Ok(response)
    }

    async fn classify_intent(&self, state: &AnalysisState) -> Result<StatePatch, Halt> {
        let mut patch = StatePatch::at(Stage::ClassifyIntent);
        match self
            .classifier
            .classify(&state.user_query, &state.available_files)
            .await
        {
            Ok(c) => {
                debug!(
                    "Classified as {} / {} ({})",
                    c.intent, c.operation_type, c.reasoning
                );
                patch.files_to_use = Some(select_files(&state.available_files, &c.files_needed));
                patch.intent = Some(c.intent);
                patch.operation_type = Some(c.operation_type);
                Ok(patch)
            }
            Err(e) => Err(Halt::structured(patch, Stage::ClassifyIntent, e)),
        }
    }

    /// Never ends the run: an unusable plan is replaced by the default one
    async fn plan(&self, state: &AnalysisState) -> StatePatch {
        let patch = StatePatch::at(Stage::Plan);
        let (Some(intent), Some(operation_type)) = (state.intent, state.operation_type) else {
            return StatePatch {
                plan: Some(Planner::default_plan(state.operation_type)),
                ..patch
            };
        };

        match self
            .planner
            .generate_plan(&state.user_query, intent, operation_type, &state.selected_files())
            .await
        {
            Ok(plan) => StatePatch {
                plan: Some(plan),
                ..patch
            },
            Err(e) => {
                let record = match e {
                    StructuredError::Schema(reason) => FailureRecord::new(
                        FailureKind::SchemaViolation,
                        Stage::Plan,
                        format!("malformed plan, using default: {}", reason),
                    ),
                    StructuredError::Transport(e) => {
                        warn!("Planner failed: {}", e);
                        FailureRecord::new(
                            FailureKind::ModelUnavailable,
                            Stage::Plan,
                            MODEL_UNAVAILABLE_DETAIL,
                        )
                    }
                };
                StatePatch {
                    plan: Some(Planner::default_plan(Some(operation_type))),
                    ..patch
                }
                .error(record)
            }
        }
    }

    /// Load every selected dataset once, keyed by binding name
    async fn load_datasets(&self, state: &AnalysisState) -> Result<IndexMap<String, Table>, Halt> {
        let mut tables = IndexMap::new();
        for file in state.selected_files() {
            match self.datasets.load(file).await {
                Ok(table) => {
                    tables.insert(file.name.clone(), table);
                }
                Err(e) => {
                    warn!("Dataset {} could not be loaded: {}", file.name, e);
                    let record = FailureRecord::new(
                        FailureKind::DatasetUnavailable,
                        Stage::ExecuteCode,
                        format!("dataset {} could not be loaded", file.name),
                    );
                    return Err(Halt {
                        kind: FailureKind::DatasetUnavailable,
                        patch: StatePatch::default().error(record),
                    });
                }
            }
        }
        Ok(tables)
    }

    async fn generate_code(&self, state: &AnalysisState) -> StatePatch {
        let attempt = state.attempt();
        let ctx = GenerationContext {
            query: &state.user_query,
            files: state.selected_files(),
            plan: state.plan.as_ref(),
            feedback: &state.feedback,
        };

        let patch = StatePatch {
            clear_outcome: true,
            ..StatePatch::at(Stage::GenerateCode)
        };
        match self.generator.generate(&ctx).await {
            Ok(code) => {
                debug!("Attempt {} produced {} bytes of code", attempt, code.len());
                StatePatch {
                    generated_code: Some(code),
                    code_valid: Some(CodeValidity::Unknown),
                    ..patch
                }
            }
            Err(GenerationError::NoCode) => {
                let detail = "schema_violation: the reply contained no code block";
                StatePatch {
                    code_valid: Some(CodeValidity::Rejected),
                    feedback: Some(vec![detail.to_string()]),
                    ..patch
                }
                .error(
                    FailureRecord::new(FailureKind::SchemaViolation, Stage::GenerateCode, detail)
                        .at_attempt(attempt),
                )
            }
            Err(GenerationError::Transport(e)) => {
                warn!("Code generation attempt {} failed: {}", attempt, e);
                StatePatch {
                    code_valid: Some(CodeValidity::Rejected),
                    feedback: Some(Vec::new()),
                    ..patch
                }
                .error(
                    FailureRecord::new(
                        FailureKind::ModelUnavailable,
                        Stage::GenerateCode,
                        MODEL_UNAVAILABLE_DETAIL,
                    )
                    .at_attempt(attempt),
                )
            }
        }
    }

    fn validate_code(&self, state: &AnalysisState) -> StatePatch {
        let patch = StatePatch::at(Stage::ValidateCode);
        let code = state.generated_code.as_deref().unwrap_or_default();
        let verdict = self.policy.evaluate(code);
        if verdict.valid {
            return StatePatch {
                code_valid: Some(CodeValidity::Valid),
                feedback: Some(Vec::new()),
                ..patch
            };
        }

        let lines = verdict.describe();
        debug!("Attempt {} rejected: {}", state.attempt(), lines.join("; "));
        let record = FailureRecord::new(
            FailureKind::PolicyViolation,
            Stage::ValidateCode,
            lines.join("; "),
        )
        .at_attempt(state.attempt())
        .with_categories(
            verdict
                .categories()
                .iter()
                .map(|c| c.as_str().to_string())
                .collect(),
        );
        StatePatch {
            code_valid: Some(CodeValidity::Rejected),
            feedback: Some(lines),
            ..patch
        }
        .error(record)
    }

    /// A timeout or an unreachable sandbox ends the run; other failures
    /// reject the candidate
    async fn execute_code(
        &self,
        state: &AnalysisState,
        tables: &IndexMap<String, Table>,
    ) -> Result<StatePatch, Halt> {
        let patch = StatePatch::at(Stage::ExecuteCode);
        let code = state.generated_code.as_deref().unwrap_or_default();
        let outcome = self
            .sandbox
            .execute(code, tables, self.settings.sandbox_timeout)
            .await;

        let (kind, message) = match &outcome {
            ExecutionOutcome::Success { .. } => {
                return Ok(StatePatch {
                    execution_outcome: Some(outcome),
                    ..patch
                })
            }
            ExecutionOutcome::Failure { kind, message } => (*kind, message.clone()),
        };

        if kind == ExecFailure::Timeout {
            let record = FailureRecord::new(
                FailureKind::TimeoutExceeded,
                Stage::ExecuteCode,
                format!(
                    "execution exceeded {:?} and was stopped",
                    self.settings.sandbox_timeout
                ),
            )
            .at_attempt(state.attempt());
            return Err(Halt {
                kind: FailureKind::TimeoutExceeded,
                patch: StatePatch {
                    execution_outcome: Some(outcome),
                    ..patch
                }
                .error(record),
            });
        }

        if kind == ExecFailure::WorkerUnavailable {
            // Regenerating cannot help while the worker is missing
            warn!("Attempt {} could not reach the sandbox", state.attempt());
            let record = FailureRecord::new(
                FailureKind::SandboxUnavailable,
                Stage::ExecuteCode,
                SANDBOX_UNAVAILABLE_DETAIL,
            )
            .at_attempt(state.attempt());
            return Err(Halt {
                kind: FailureKind::SandboxUnavailable,
                patch: StatePatch {
                    execution_outcome: Some(outcome),
                    ..patch
                }
                .error(record),
            });
        }

        let detail = format!("{}: {}", kind.as_str(), message);
        debug!("Attempt {} failed at runtime: {}", state.attempt(), detail);
        let record = FailureRecord::new(FailureKind::RuntimeFailure, Stage::ExecuteCode, &detail)
            .at_attempt(state.attempt())
            .with_categories(vec![FailureKind::RuntimeFailure.as_str().to_string()]);
        let feedback = format!("runtime_failure: {}", record.detail);
        Ok(StatePatch {
            code_valid: Some(CodeValidity::Rejected),
            execution_outcome: Some(outcome),
            feedback: Some(vec![feedback]),
            ..patch
        }
        .error(record))
    }

    async fn explain(&self, state: &AnalysisState) -> Result<StatePatch, Halt> {
        let patch = StatePatch::at(Stage::Explain);
        let Some(result) = state.result() else {
            return Ok(patch);
        };
        match self
            .explainer
            .explain(
                &state.user_query,
                result,
                &state.files_used(),
                state.intent,
                state.operation_type,
            )
            .await
        {
            Ok(e) => Ok(StatePatch {
                explanation: Some(e.explanation),
                recommendations: Some(e.recommendations),
                ..patch
            }),
            Err(e) => Err(Halt::structured(patch, Stage::Explain, e)),
        }
    }

    fn assemble(state: &AnalysisState) -> FinalResult {
        FinalResult {
            session_id: state.session_id.clone(),
            intent: state.intent,
            operation_type: state.operation_type,
            files_used: state.files_used(),
            generated_code: state.generated_code.clone(),
            result: state.result().cloned(),
            explanation: state.explanation.clone().unwrap_or_default(),
            recommendations: state.recommendations.clone(),
            errors: state.errors.clone(),
            retry_count: state.retry_count,
            cached: false,
        }
    }

    fn from_cache(state: &AnalysisState, hit: CachedRun) -> FinalResult {
        FinalResult {
            session_id: state.session_id.clone(),
            intent: hit.intent,
            operation_type: hit.operation_type,
            files_used: hit.files_used,
            generated_code: hit.generated_code,
            result: Some(hit.result),
            explanation: hit.explanation,
            recommendations: hit.recommendations,
            errors: Vec::new(),
            retry_count: 0,
            cached: true,
        }
    }

    fn halt(&self, mut state: AnalysisState, halt: Halt) -> TerminalError {
        state.apply(halt.patch);
        self.terminate(state, halt.kind)
    }

    /// Build the apologetic response. The rejected code stays out of it.
    fn terminate(&self, mut state: AnalysisState, kind: FailureKind) -> TerminalError {
        let categories: Vec<String> = state
            .failure_categories()
            .into_iter()
            .filter(|c| c != kind.as_str())
            .collect();
        state.apply(StatePatch {
            explanation: Some(terminal_explanation(kind, state.attempt(), &categories)),
            recommendations: Some(fallback_recommendations()),
            ..StatePatch::at(Stage::AssembleResponse)
        });
        warn!(
            "Run for session {} ended with {} after {} attempt(s)",
            state.session_id,
            kind,
            state.attempt()
        );

        let mut response = Self::assemble(&state);
        response.generated_code = None;
        response.result = None;
        TerminalError {
            kind,
            response,
            attempted_code: state.generated_code,
        }
    }
}
