//! Rate limiting module
//!
//! Caps how many questions one session may ask, over two sliding windows:
//!
//! - **Per minute**: `limits.requests_per_minute`
//! - **Per hour**: `limits.requests_per_hour`
//!
//! # Database Tracking
//!
//! Requests are recorded in the `rate_limits` table. The check and the
//! record happen inside one `BEGIN IMMEDIATE` transaction, so two
//! concurrent requests for the same session cannot both pass on the last
//! free slot. Entries older than an hour are removed on every write.

use anyhow::{Context, Result};
use sdk::errors::EngineError;
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::config::LimitsConfig;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;

/// Rate limiter for tracking and enforcing per-session limits
pub struct RateLimiter {
    pool: SqlitePool,
    per_minute: i64,
    per_hour: i64,
}

impl RateLimiter {
    pub fn new(pool: SqlitePool, limits: &LimitsConfig) -> Self {
        Self {
            pool,
            per_minute: limits.requests_per_minute,
            per_hour: limits.requests_per_hour,
        }
    }

    /// Admit one request for `source` or fail with
    /// `EngineError::RateLimitExceeded`.
    ///
    /// An admitted request is recorded before this returns.
    pub async fn check_and_record(&self, source: &str) -> Result<()> {
        let now = now_millis()?;
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire rate limit connection")?;

        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .context("Failed to start rate limit transaction")?;

        match self.admit(&mut conn, source, now).await {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .context("Failed to commit rate limit transaction")?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    warn!("Rate limit rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    async fn admit(&self, conn: &mut PoolConnection<Sqlite>, source: &str, now: i64) -> Result<()> {
        for (limit, window, label) in [
            (self.per_minute, MINUTE_MS, "1 minute"),
            (self.per_hour, HOUR_MS, "1 hour"),
        ] {
            let count = count_since(conn, source, now - window).await?;
            debug!("Rate limit check ({}): {}/{} for {}", label, count, limit, source);
            if count >= limit {
                warn!(
                    "Rate limit exceeded for source {} ({}): {}/{}",
                    source, label, count, limit
                );
                return Err(EngineError::RateLimitExceeded {
                    src: source.to_string(),
                    count,
                    limit,
                    window: label.to_string(),
                }
                .into());
            }
        }

        sqlx::query("INSERT INTO rate_limits (source, timestamp) VALUES (?, ?)")
            .bind(source)
            .bind(now)
            .execute(&mut **conn)
            .await
            .context("Failed to record request")?;

        let cleaned = sqlx::query("DELETE FROM rate_limits WHERE timestamp < ?")
            .bind(now - HOUR_MS)
            .execute(&mut **conn)
            .await
            .context("Failed to clean up old entries")?;
        if cleaned.rows_affected() > 0 {
            debug!("Cleaned up {} old rate limit entries", cleaned.rows_affected());
        }

        Ok(())
    }

    /// Requests recorded for `source` in the last hour
    pub async fn recent_count(&self, source: &str) -> Result<i64> {
        let since = now_millis()? - HOUR_MS;
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM rate_limits WHERE source = ? AND timestamp >= ?")
                .bind(source)
                .bind(since)
                .fetch_one(&self.pool)
                .await
                .context("Failed to count requests")?;
        Ok(count)
    }
}

async fn count_since(conn: &mut PoolConnection<Sqlite>, source: &str, since: i64) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM rate_limits WHERE source = ? AND timestamp >= ?")
            .bind(source)
            .bind(since)
            .fetch_one(&mut **conn)
            .await
            .context("Failed to count requests")?;
    Ok(count)
}

fn now_millis() -> Result<i64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("Failed to get current time")?
        .as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn setup(per_minute: i64, per_hour: i64) -> (TempDir, Database, RateLimiter) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let limits = LimitsConfig {
            requests_per_minute: per_minute,
            requests_per_hour: per_hour,
            ..Default::default()
        };
        let limiter = RateLimiter::new(db.pool().clone(), &limits);
        (temp_dir, db, limiter)
    }

    #[tokio::test]
    async fn test_minute_window() {
        let (_dir, _db, limiter) = setup(3, 100).await;

        for i in 0..3 {
            assert!(
                limiter.check_and_record("session-1").await.is_ok(),
                "Request {} should be allowed",
                i
            );
        }

        let err = limiter.check_and_record("session-1").await.unwrap_err();
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::RateLimitExceeded { count, limit, window, .. }) => {
                assert_eq!((*count, *limit), (3, 3));
                assert_eq!(window, "1 minute");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // Rejected requests are not recorded
        assert_eq!(limiter.recent_count("session-1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let (_dir, _db, limiter) = setup(1, 100).await;
        limiter.check_and_record("a").await.unwrap();
        limiter.check_and_record("b").await.unwrap();
        assert!(limiter.check_and_record("a").await.is_err());
    }

    #[tokio::test]
    async fn test_hour_window() {
        let (_dir, _db, limiter) = setup(100, 5).await;

        // Five requests spread over the last hour, all outside the minute window
        let now = now_millis().unwrap();
        for i in 1..=5 {
            sqlx::query("INSERT INTO rate_limits (source, timestamp) VALUES (?, ?)")
                .bind("session-1")
                .bind(now - i * 5 * MINUTE_MS)
                .execute(&limiter.pool)
                .await
                .unwrap();
        }

        let err = limiter.check_and_record("session-1").await.unwrap_err();
        assert!(err.to_string().contains("1 hour"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_respect_limit() {
        let (_dir, _db, limiter) = setup(5, 100).await;
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.check_and_record("busy").await.is_ok() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }
}
