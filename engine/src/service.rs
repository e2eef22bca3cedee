//! Analysis service
//!
//! The boundary in front of the conductor. A request is validated and
//! rate limited before any stage runs, and every finished run is handed
//! to the run recorder. Recording is best effort: a failed write is
//! logged and the caller still gets the answer.

use crate::cache::{ResultCache, SqliteCacheStore};
use crate::conductor::{Conductor, ConductorSettings, FinalResult, TerminalError};
use crate::config::{Config, LimitsConfig};
use crate::datasets::CsvDatasetProvider;
use crate::db::{Database, RunRecorder, RunSummary};
use crate::llm::{LLMProvider, LLMRouter};
use crate::policy::PolicyValidator;
use crate::rate_limiter::RateLimiter;
use crate::sandbox::ProcessSandbox;
use crate::secrets::SecretManager;
use anyhow::{Context, Result};
use sdk::errors::EngineError;
use sdk::DatasetDescriptor;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

/// Longest accepted session id
pub const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    RateLimited(EngineError),

    /// The run ended without an answer; the response explains why
    #[error(transparent)]
    Analysis(Box<TerminalError>),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// One question from a caller
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub session_id: String,
    pub query: String,
    pub files: Vec<DatasetDescriptor>,
}

pub struct AnalysisService {
    conductor: Conductor,
    limits: LimitsConfig,
    limiter: Option<RateLimiter>,
    recorder: Option<Arc<dyn RunRecorder>>,
}

impl AnalysisService {
    pub fn new(conductor: Conductor, limits: LimitsConfig) -> Self {
        Self {
            conductor,
            limits,
            limiter: None,
            recorder: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn RunRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Wire the full stack from configuration
    pub fn from_config(config: &Config, db: &Database) -> Result<Self> {
        let secrets = SecretManager::new("sift");
        let llm: Arc<dyn LLMProvider> = Arc::new(LLMRouter::from_config(
            Arc::new(config.llm.clone()),
            &secrets,
        ));
        let sandbox = ProcessSandbox::from_config(&config.pipeline)
            .context("Failed to locate the sandbox worker")?;
        let policy = PolicyValidator::new().context("Failed to compile the policy deny-list")?;

        let mut conductor = Conductor::new(
            llm,
            policy,
            Arc::new(sandbox),
            Arc::new(CsvDatasetProvider::new(config.pipeline.sample_rows)),
            ConductorSettings::from_config(&config.pipeline),
        );
        if config.cache.enabled {
            let cache = match config.cache.backend.as_str() {
                "sqlite" => ResultCache::new(
                    Arc::new(SqliteCacheStore::new(db.pool().clone())),
                    config.cache.ttl(),
                ),
                _ => ResultCache::in_memory(config.cache.max_entries, config.cache.ttl()),
            };
            conductor = conductor.with_cache(cache);
        }

        Ok(Self::new(conductor, config.limits.clone())
            .with_rate_limiter(RateLimiter::new(db.pool().clone(), &config.limits))
            .with_recorder(Arc::new(db.runs())))
    }

    /// Validate, rate limit, run and record one question
    pub async fn ask(&self, request: AnalysisRequest) -> Result<FinalResult, ServiceError> {
        validate_request(&request, &self.limits)?;

        if let Some(limiter) = &self.limiter {
            if let Err(e) = limiter.check_and_record(&request.session_id).await {
                return Err(match e.downcast::<EngineError>() {
                    Ok(engine) => ServiceError::RateLimited(engine),
                    Err(other) => ServiceError::Internal(other),
                });
            }
        }

        let started = Instant::now();
        let outcome = self
            .conductor
            .run(&request.query, &request.session_id, request.files)
            .await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let run_id = uuid::Uuid::new_v4().to_string();
        if let Some(recorder) = &self.recorder {
            let summary = RunSummary::from_outcome(&run_id, &request.query, &outcome, duration_ms);
            if let Err(e) = recorder.record(&summary).await {
                warn!("Failed to record run {}: {:#}", run_id, e);
            }
        }
        info!("Run {} completed in {}ms", run_id, duration_ms);

        outcome.map_err(|e| ServiceError::Analysis(Box::new(e)))
    }
}

/// Reject malformed requests before they reach the conductor
pub fn validate_request(request: &AnalysisRequest, limits: &LimitsConfig) -> Result<(), ServiceError> {
    let session = &request.session_id;
    if session.is_empty()
        || session.len() > MAX_SESSION_ID_LEN
        || !session
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ServiceError::InvalidRequest(format!(
            "session id must be 1-{} characters of letters, digits, '_' or '-'",
            MAX_SESSION_ID_LEN
        )));
    }

    let query_chars = request.query.trim().chars().count();
    if query_chars == 0 {
        return Err(ServiceError::InvalidRequest("query is empty".to_string()));
    }
    if query_chars > limits.max_query_chars {
        return Err(ServiceError::InvalidRequest(format!(
            "query is longer than {} characters",
            limits.max_query_chars
        )));
    }

    if request.files.is_empty() {
        return Err(ServiceError::InvalidRequest(
            "at least one file is required".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn request(session: &str, query: &str, files: usize) -> AnalysisRequest {
        AnalysisRequest {
            session_id: session.to_string(),
            query: query.to_string(),
            files: (0..files)
                .map(|i| DatasetDescriptor {
                    id: format!("f{}", i),
                    name: format!("data_{}", i),
                    columns: Vec::new(),
                    column_types: IndexMap::new(),
                    sample_rows: Vec::new(),
                    row_count: 0,
                    version: "v1".to_string(),
                    source: None,
                    time_period: None,
                    period_type: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_accepts_well_formed_request() {
        let limits = LimitsConfig::default();
        assert!(validate_request(&request("session_1-a", "average X by Group", 1), &limits).is_ok());
    }

    #[test]
    fn test_rejects_bad_session_ids() {
        let limits = LimitsConfig::default();
        let long = "x".repeat(129);
        for session in ["", "has space", "semi;colon", long.as_str()] {
            assert!(
                matches!(
                    validate_request(&request(session, "q", 1), &limits),
                    Err(ServiceError::InvalidRequest(_))
                ),
                "{:?} should be rejected",
                session
            );
        }
        assert!(validate_request(&request(&"x".repeat(128), "q", 1), &limits).is_ok());
    }

    #[test]
    fn test_rejects_empty_or_long_queries() {
        let limits = LimitsConfig {
            max_query_chars: 10,
            ..Default::default()
        };
        assert!(validate_request(&request("s", "   ", 1), &limits).is_err());
        assert!(validate_request(&request("s", "0123456789", 1), &limits).is_ok());
        assert!(validate_request(&request("s", "0123456789a", 1), &limits).is_err());
    }

    #[test]
    fn test_requires_a_file() {
        let err = validate_request(&request("s", "q", 0), &LimitsConfig::default()).unwrap_err();
        assert!(err.to_string().contains("at least one file"));
    }
}
