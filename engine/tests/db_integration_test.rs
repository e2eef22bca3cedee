/// Integration tests for the database and the services that persist to it
///
/// Tests the database lifecycle, the persistent result cache and the
/// analysis service wired to SQLite: run recording, rate limiting and
/// request validation.
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use sift_engine::cache::{CachedRun, Fingerprint, ResultCache, SqliteCacheStore};
use sift_engine::conductor::{Conductor, ConductorSettings, FailureKind, Intent};
use sift_engine::config::LimitsConfig;
use sift_engine::datasets::CsvDatasetProvider;
use sift_engine::db::{Database, RunStatus};
use sift_engine::llm::{CompletionRequest, LLMProvider};
use sift_engine::policy::PolicyValidator;
use sift_engine::rate_limiter::RateLimiter;
use sift_engine::sandbox::{ProcessSandbox, WORKER_SUBCOMMAND};
use sift_engine::service::{AnalysisRequest, AnalysisService, ServiceError};

use sdk::{ResultValue, Scalar};

/// Fixed replies per stage; `code` is what the generator always returns
struct FixedLlm {
    code: &'static str,
    calls: AtomicUsize,
}

impl FixedLlm {
    fn new(code: &'static str) -> Self {
        Self {
            code,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LLMProvider for FixedLlm {
    fn name(&self) -> &str {
        "fixed"
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn generate(&self, request: &CompletionRequest) -> sift_engine::llm::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let system = &request.messages[0].content;
        let reply = if system.contains("Classify the user's question") {
            r#"{"intent": "aggregate", "operation_type": "single_table", "files_needed": [], "reasoning": "total"}"#
        } else if system.contains("data analysis planner") {
            r#"{"operations": ["Sum X"], "columns_to_use": ["X"], "reasoning": "total"}"#
        } else if system.contains("Python/pandas subset") {
            self.code
        } else {
            r#"{"explanation": "The total is 600.", "recommendations": []}"#
        };
        Ok(reply.to_string())
    }
}

struct Fixture {
    dir: TempDir,
    db: Database,
    llm: Arc<FixedLlm>,
}

impl Fixture {
    async fn new(code: &'static str) -> Self {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("sift.db")).await.unwrap();
        std::fs::write(dir.path().join("sales.csv"), "Group,X\nA,100\nB,200\nA,300\n").unwrap();
        Self {
            dir,
            db,
            llm: Arc::new(FixedLlm::new(code)),
        }
    }

    fn service(&self, limits: LimitsConfig) -> AnalysisService {
        let conductor = Conductor::new(
            Arc::clone(&self.llm) as Arc<dyn LLMProvider>,
            PolicyValidator::new().unwrap(),
            Arc::new(ProcessSandbox::new(
                env!("CARGO_BIN_EXE_sift"),
                vec![WORKER_SUBCOMMAND.to_string()],
            )),
            Arc::new(CsvDatasetProvider::default()),
            ConductorSettings {
                max_retries: 1,
                sandbox_timeout: Duration::from_secs(10),
                preview_chars: 3000,
            },
        )
        .with_cache(ResultCache::new(
            Arc::new(SqliteCacheStore::new(self.db.pool().clone())),
            Duration::from_secs(600),
        ));

        AnalysisService::new(conductor, limits.clone())
            .with_rate_limiter(RateLimiter::new(self.db.pool().clone(), &limits))
            .with_recorder(Arc::new(self.db.runs()))
    }

    async fn request(&self, session: &str, query: &str) -> AnalysisRequest {
        let descriptor = CsvDatasetProvider::default()
            .describe_path(&self.dir.path().join("sales.csv"), None)
            .await
            .unwrap();
        AnalysisRequest {
            session_id: session.to_string(),
            query: query.to_string(),
            files: vec![descriptor],
        }
    }
}

#[tokio::test]
async fn test_database_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("sift.db");

    let db = Database::new(&db_path).await.unwrap();
    assert!(db_path.exists());
    assert!(temp_dir.path().join("sift.db-wal").exists());

    for table in ["runs", "rate_limits", "result_cache"] {
        let result = sqlx::query(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(db.pool())
            .await;
        assert!(result.is_ok(), "table {} should exist", table);
    }

    db.close().await.unwrap();

    // Reopening runs the migrations again without error
    let db = Database::new(&db_path).await.unwrap();
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_cached_results_survive_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("sift.db");
    let key = Fingerprint::compute("s1", "total of X", &[]);
    let run = CachedRun {
        intent: Some(Intent::Aggregate),
        operation_type: None,
        files_used: vec!["sales".to_string()],
        generated_code: Some("result = 600".to_string()),
        result: ResultValue::Scalar(Scalar::Int(600)),
        explanation: "The total is 600.".to_string(),
        recommendations: Vec::new(),
    };

    {
        let db = Database::new(&db_path).await.unwrap();
        let cache = ResultCache::new(
            Arc::new(SqliteCacheStore::new(db.pool().clone())),
            Duration::from_secs(600),
        );
        cache.put(&key, &run).await;
        db.close().await.unwrap();
    }

    let db = Database::new(&db_path).await.unwrap();
    let cache = ResultCache::new(
        Arc::new(SqliteCacheStore::new(db.pool().clone())),
        Duration::from_secs(600),
    );
    assert_eq!(cache.get(&key).await, Some(run));
}

#[tokio::test]
async fn test_expired_rows_are_purged() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("sift.db")).await.unwrap();
    let store = SqliteCacheStore::new(db.pool().clone());
    let cache = ResultCache::new(Arc::new(store.clone()), Duration::from_secs(1));

    let key = Fingerprint::compute("s1", "q", &[]);
    let run = CachedRun {
        intent: None,
        operation_type: None,
        files_used: Vec::new(),
        generated_code: None,
        result: ResultValue::Scalar(Scalar::Int(1)),
        explanation: String::new(),
        recommendations: Vec::new(),
    };
    cache.put(&key, &run).await;

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(cache.get(&key).await, None);
    assert_eq!(store.purge_expired().await.unwrap(), 1);
}

#[tokio::test]
async fn test_service_records_successful_run() {
    let fixture = Fixture::new("```python\nresult = df['X'].sum()\n```").await;
    let service = fixture.service(LimitsConfig::default());

    let response = service
        .ask(fixture.request("analyst-1", "total of X").await)
        .await
        .unwrap();
    assert_eq!(response.result, Some(ResultValue::Scalar(Scalar::Int(600))));

    // Second ask comes from the persistent cache
    let again = service
        .ask(fixture.request("analyst-1", "TOTAL of x").await)
        .await
        .unwrap();
    assert!(again.cached);

    let runs = fixture.db.runs().recent(Some("analyst-1"), 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Succeeded));
    assert_eq!(runs.iter().filter(|r| r.cached).count(), 1);
    let first = runs.iter().find(|r| !r.cached).unwrap();
    assert_eq!(first.generated_code.as_deref(), Some("result = df['X'].sum()"));
    assert_eq!(first.files_used, vec!["sales"]);
}

#[tokio::test]
async fn test_service_records_failed_run_with_attempted_code() {
    let fixture = Fixture::new("```python\nimport os\nresult = os.listdir('/')\n```").await;
    let service = fixture.service(LimitsConfig::default());

    let err = service
        .ask(fixture.request("analyst-1", "list the disk").await)
        .await
        .unwrap_err();
    let ServiceError::Analysis(terminal) = err else {
        panic!("expected an analysis failure");
    };
    assert_eq!(terminal.kind, FailureKind::RetryBudgetExhausted);
    assert!(terminal.response.generated_code.is_none());

    let runs = fixture.db.runs().recent(None, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].failure_kind, Some(FailureKind::RetryBudgetExhausted));
    assert!(runs[0].generated_code.as_deref().unwrap().contains("import os"));
    assert!(runs[0].result.is_none());
}

#[tokio::test]
async fn test_service_rate_limits_per_session() {
    let fixture = Fixture::new("```python\nresult = df['X'].sum()\n```").await;
    let limits = LimitsConfig {
        requests_per_minute: 2,
        ..Default::default()
    };
    let service = fixture.service(limits);

    for _ in 0..2 {
        service
            .ask(fixture.request("busy", "total of X").await)
            .await
            .unwrap();
    }
    let err = service
        .ask(fixture.request("busy", "total of X").await)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::RateLimited(_)));

    // Other sessions are unaffected
    service
        .ask(fixture.request("calm", "total of X").await)
        .await
        .unwrap();

    // The rejected request was not recorded as a run
    let runs = fixture.db.runs().recent(Some("busy"), 10).await.unwrap();
    assert_eq!(runs.len(), 2);
}

#[tokio::test]
async fn test_invalid_request_never_reaches_the_model() {
    let fixture = Fixture::new("```python\nresult = 1\n```").await;
    let service = fixture.service(LimitsConfig::default());

    let err = service
        .ask(fixture.request("bad session!", "total").await)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRequest(_)));

    let err = service
        .ask(fixture.request("ok", "   ").await)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRequest(_)));

    assert_eq!(fixture.llm.calls.load(Ordering::SeqCst), 0);
}
