/// Run history
///
/// Every finished run, successful or not, is stored as one summary row.
/// List-valued fields are kept as JSON text. The orchestrator never writes
/// here directly: the service hands a `RunSummary` to a `RunRecorder`.
use crate::conductor::{FailureKind, FailureRecord, FinalResult, Intent, OperationType, TerminalError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sdk::ResultValue;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

/// What gets persisted for one run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub id: String,
    pub session_id: String,
    pub query: String,
    pub status: RunStatus,
    pub failure_kind: Option<FailureKind>,
    pub intent: Option<Intent>,
    pub operation_type: Option<OperationType>,
    pub files_used: Vec<String>,
    /// Final code, or the last rejected candidate of a failed run
    pub generated_code: Option<String>,
    pub result: Option<ResultValue>,
    pub explanation: String,
    pub recommendations: Vec<String>,
    pub errors: Vec<FailureRecord>,
    pub retry_count: u32,
    pub cached: bool,
    pub duration_ms: i64,
    pub created_at: i64,
}

impl RunSummary {
    /// Summarise a conductor outcome
    pub fn from_outcome(
        id: impl Into<String>,
        query: &str,
        outcome: &std::result::Result<FinalResult, TerminalError>,
        duration_ms: i64,
    ) -> Self {
        let (response, status, failure_kind, generated_code) = match outcome {
            Ok(response) => (
                response,
                RunStatus::Succeeded,
                None,
                response.generated_code.clone(),
            ),
            Err(terminal) => (
                &terminal.response,
                RunStatus::Failed,
                Some(terminal.kind),
                terminal.attempted_code.clone(),
            ),
        };

        Self {
            id: id.into(),
            session_id: response.session_id.clone(),
            query: query.to_string(),
            status,
            failure_kind,
            intent: response.intent,
            operation_type: response.operation_type,
            files_used: response.files_used.clone(),
            generated_code,
            result: response.result.clone(),
            explanation: response.explanation.clone(),
            recommendations: response.recommendations.clone(),
            errors: response.errors.clone(),
            retry_count: response.retry_count,
            cached: response.cached,
            duration_ms,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or_default(),
        }
    }
}

/// Sink for finished runs
#[async_trait]
pub trait RunRecorder: Send + Sync {
    async fn record(&self, summary: &RunSummary) -> Result<()>;
}

/// Run repository for database operations
pub struct RunRepository {
    pool: SqlitePool,
}

impl RunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, summary: &RunSummary) -> Result<()> {
        sqlx::query(
            "INSERT INTO runs (id, session_id, query, status, failure_kind, intent, operation_type, \
             files_used, generated_code, result, explanation, recommendations, errors, retry_count, \
             cached, duration_ms, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&summary.id)
        .bind(&summary.session_id)
        .bind(&summary.query)
        .bind(summary.status.as_str())
        .bind(summary.failure_kind.map(|k| k.as_str()))
        .bind(summary.intent.map(|i| i.as_str()))
        .bind(summary.operation_type.map(|o| o.as_str()))
        .bind(serde_json::to_string(&summary.files_used)?)
        .bind(&summary.generated_code)
        .bind(summary.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&summary.explanation)
        .bind(serde_json::to_string(&summary.recommendations)?)
        .bind(serde_json::to_string(&summary.errors)?)
        .bind(summary.retry_count as i64)
        .bind(summary.cached)
        .bind(summary.duration_ms)
        .bind(summary.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to record run")?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<RunSummary>> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch run")?;

        row.map(|r| Self::from_row(&r)).transpose()
    }

    /// Most recent runs first, optionally for one session
    pub async fn recent(&self, session_id: Option<&str>, limit: i64) -> Result<Vec<RunSummary>> {
        let rows = match session_id {
            Some(session) => {
                sqlx::query(
                    "SELECT * FROM runs WHERE session_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
                )
                .bind(session)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM runs ORDER BY created_at DESC, rowid DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("Failed to fetch recent runs")?;

        rows.iter().map(Self::from_row).collect()
    }

    fn from_row(r: &SqliteRow) -> Result<RunSummary> {
        let json = |column: &str| -> Result<String> {
            r.try_get::<String, _>(column)
                .with_context(|| format!("Missing column {}", column))
        };
        let parse_opt = |column: &str| -> Option<String> {
            r.try_get::<Option<String>, _>(column).ok().flatten()
        };

        Ok(RunSummary {
            id: r.get("id"),
            session_id: r.get("session_id"),
            query: r.get("query"),
            status: match r.get::<String, _>("status").as_str() {
                "succeeded" => RunStatus::Succeeded,
                _ => RunStatus::Failed,
            },
            failure_kind: parse_opt("failure_kind")
                .and_then(|k| serde_json::from_value(serde_json::Value::String(k)).ok()),
            intent: parse_opt("intent").and_then(|i| i.parse().ok()),
            operation_type: parse_opt("operation_type").and_then(|o| o.parse().ok()),
            files_used: serde_json::from_str(&json("files_used")?)?,
            generated_code: parse_opt("generated_code"),
            result: parse_opt("result")
                .map(|s| serde_json::from_str(&s))
                .transpose()?,
            explanation: r.get("explanation"),
            recommendations: serde_json::from_str(&json("recommendations")?)?,
            errors: serde_json::from_str(&json("errors")?)?,
            retry_count: r.get::<i64, _>("retry_count") as u32,
            cached: r.get("cached"),
            duration_ms: r.get("duration_ms"),
            created_at: r.get("created_at"),
        })
    }
}

#[async_trait]
impl RunRecorder for RunRepository {
    async fn record(&self, summary: &RunSummary) -> Result<()> {
        self.insert(summary).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::Stage;
    use crate::db::Database;
    use sdk::Scalar;
    use tempfile::TempDir;

    fn response(session: &str) -> FinalResult {
        FinalResult {
            session_id: session.to_string(),
            intent: Some(Intent::Aggregate),
            operation_type: Some(OperationType::SingleTable),
            files_used: vec!["sales".to_string()],
            generated_code: Some("result = 1".to_string()),
            result: Some(ResultValue::Scalar(Scalar::Int(1))),
            explanation: "One.".to_string(),
            recommendations: vec!["Look closer".to_string()],
            errors: Vec::new(),
            retry_count: 0,
            cached: false,
        }
    }

    async fn setup() -> (TempDir, RunRepository) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("sift.db")).await.unwrap();
        (temp_dir, db.runs())
    }

    #[tokio::test]
    async fn test_record_and_fetch_success() {
        let (_dir, repo) = setup().await;
        let summary = RunSummary::from_outcome("run-1", "q", &Ok(response("s1")), 12);
        repo.record(&summary).await.unwrap();

        let loaded = repo.get("run-1").await.unwrap().unwrap();
        assert_eq!(loaded, summary);
        assert_eq!(loaded.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_failed_run_keeps_attempted_code() {
        let (_dir, repo) = setup().await;
        let mut failed = response("s1");
        failed.generated_code = None;
        failed.result = None;
        failed.errors = vec![FailureRecord::new(
            FailureKind::PolicyViolation,
            Stage::ValidateCode,
            "system_access: forbidden pattern \"import os\"",
        )
        .with_categories(vec!["system_access".to_string()])];
        let terminal = TerminalError {
            kind: FailureKind::RetryBudgetExhausted,
            response: failed,
            attempted_code: Some("import os".to_string()),
        };

        let summary = RunSummary::from_outcome("run-2", "q", &Err(terminal), 5);
        repo.record(&summary).await.unwrap();

        let loaded = repo.get("run-2").await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.failure_kind, Some(FailureKind::RetryBudgetExhausted));
        assert_eq!(loaded.generated_code.as_deref(), Some("import os"));
        assert_eq!(loaded.errors[0].categories, vec!["system_access"]);
        assert!(loaded.result.is_none());
    }

    #[tokio::test]
    async fn test_recent_filters_by_session() {
        let (_dir, repo) = setup().await;
        for (id, session) in [("a", "s1"), ("b", "s2"), ("c", "s1")] {
            let summary = RunSummary::from_outcome(id, "q", &Ok(response(session)), 1);
            repo.record(&summary).await.unwrap();
        }

        let s1 = repo.recent(Some("s1"), 10).await.unwrap();
        assert_eq!(s1.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["c", "a"]);
        assert_eq!(repo.recent(None, 2).await.unwrap().len(), 2);
    }
}
