//! Result cache
//!
//! Completed runs are memoized under a fingerprint of the session, the
//! normalized question and every available file's id and content version.
//! A changed file therefore changes the fingerprint, and entries that saw
//! the old content are never served again.
//!
//! The cache is an optimisation only: a store that fails is logged and
//! treated as a miss, and a failed write is skipped.

use crate::conductor::{Intent, OperationType};
use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use sdk::{DatasetDescriptor, ResultValue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Cache payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Cache key for a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// SHA-256 over session, normalized query and sorted `id:version` pairs
    pub fn compute(session_id: &str, query: &str, files: &[DatasetDescriptor]) -> Self {
        let mut versions: Vec<(&str, &str)> = files
            .iter()
            .map(|f| (f.id.as_str(), f.version.as_str()))
            .collect();
        versions.sort();

        let mut hasher = Sha256::new();
        hasher.update(session_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_query(query).as_bytes());
        for (id, version) in versions {
            hasher.update([0u8]);
            hasher.update(id.as_bytes());
            hasher.update(b":");
            hasher.update(version.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, collapse whitespace, trim
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// What a cache hit hands back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRun {
    pub intent: Option<Intent>,
    pub operation_type: Option<OperationType>,
    pub files_used: Vec<String>,
    pub generated_code: Option<String>,
    pub result: ResultValue,
    pub explanation: String,
    pub recommendations: Vec<String>,
}

/// Backing store for cached runs
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &Fingerprint) -> Result<Option<CachedRun>, CacheError>;

    async fn put(&self, key: &Fingerprint, run: &CachedRun, ttl: Duration) -> Result<(), CacheError>;
}

#[derive(Clone)]
struct Entry {
    run: Arc<CachedRun>,
    ttl: Duration,
}

/// Per-entry time to live
struct EntryTtl;

impl Expiry<String, Entry> for EntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process store backed by moka
#[derive(Clone)]
pub struct MemoryCacheStore {
    inner: Cache<String, Entry>,
}

impl MemoryCacheStore {
    pub fn new(max_entries: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_entries)
                .expire_after(EntryTtl)
                .build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &Fingerprint) -> Result<Option<CachedRun>, CacheError> {
        Ok(self
            .inner
            .get(key.as_str())
            .await
            .map(|entry| entry.run.as_ref().clone()))
    }

    async fn put(&self, key: &Fingerprint, run: &CachedRun, ttl: Duration) -> Result<(), CacheError> {
        self.inner
            .insert(
                key.as_str().to_string(),
                Entry {
                    run: Arc::new(run.clone()),
                    ttl,
                },
            )
            .await;
        Ok(())
    }
}

/// Store in the engine's SQLite database; survives restarts
#[derive(Clone)]
pub struct SqliteCacheStore {
    pool: SqlitePool,
}

impl SqliteCacheStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Delete expired rows, returning how many were removed
    pub async fn purge_expired(&self) -> Result<u64, CacheError> {
        let result = sqlx::query("DELETE FROM result_cache WHERE expires_at <= ?")
            .bind(now_secs())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, key: &Fingerprint) -> Result<Option<CachedRun>, CacheError> {
        let payload: Option<String> = sqlx::query_scalar(
            "SELECT payload FROM result_cache WHERE fingerprint = ? AND expires_at > ?",
        )
        .bind(key.as_str())
        .bind(now_secs())
        .fetch_optional(&self.pool)
        .await?;

        payload
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .map_err(CacheError::from)
    }

    async fn put(&self, key: &Fingerprint, run: &CachedRun, ttl: Duration) -> Result<(), CacheError> {
        let payload = serde_json::to_string(run)?;
        let now = now_secs();
        sqlx::query(
            "INSERT OR REPLACE INTO result_cache (fingerprint, payload, created_at, expires_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(key.as_str())
        .bind(payload)
        .bind(now)
        .bind(now + ttl.as_secs() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Front of the cache used by the conductor
#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn in_memory(max_entries: u64, ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryCacheStore::new(max_entries)), ttl)
    }

    /// Look up a run; any store failure is a miss
    pub async fn get(&self, key: &Fingerprint) -> Option<CachedRun> {
        match self.store.get(key).await {
            Ok(Some(run)) => {
                debug!("Cache hit for {}", key);
                Some(run)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Cache lookup failed, treating as miss: {}", e);
                None
            }
        }
    }

    /// Store a run; a failed write is logged and skipped
    pub async fn put(&self, key: &Fingerprint, run: &CachedRun) {
        if let Err(e) = self.store.put(key, run, self.ttl).await {
            warn!("Cache write failed, skipping: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use sdk::Scalar;

    fn file(id: &str, version: &str) -> DatasetDescriptor {
        DatasetDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            columns: Vec::new(),
            column_types: IndexMap::new(),
            sample_rows: Vec::new(),
            row_count: 0,
            version: version.to_string(),
            source: None,
            time_period: None,
            period_type: None,
        }
    }

    fn run() -> CachedRun {
        CachedRun {
            intent: Some(Intent::Aggregate),
            operation_type: Some(OperationType::SingleTable),
            files_used: vec!["sales".to_string()],
            generated_code: Some("result = 1".to_string()),
            result: ResultValue::Scalar(Scalar::Int(1)),
            explanation: "one".to_string(),
            recommendations: Vec::new(),
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _key: &Fingerprint) -> Result<Option<CachedRun>, CacheError> {
            Err(CacheError::Store(sqlx::Error::PoolClosed))
        }

        async fn put(&self, _: &Fingerprint, _: &CachedRun, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Store(sqlx::Error::PoolClosed))
        }
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("  Average  X\tby GROUP \n"), "average x by group");
    }

    #[test]
    fn test_fingerprint_ignores_file_order_and_query_spacing() {
        let a = Fingerprint::compute("s1", "Average X", &[file("f1", "v1"), file("f2", "v1")]);
        let b = Fingerprint::compute("s1", " average   x ", &[file("f2", "v1"), file("f1", "v1")]);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_tracks_session_and_version() {
        let base = Fingerprint::compute("s1", "q", &[file("f1", "v1")]);
        assert_ne!(base, Fingerprint::compute("s2", "q", &[file("f1", "v1")]));
        assert_ne!(base, Fingerprint::compute("s1", "q", &[file("f1", "v2")]));
        assert_ne!(base, Fingerprint::compute("s1", "q", &[file("f1", "v1"), file("f2", "v1")]));
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let cache = ResultCache::in_memory(100, Duration::from_secs(60));
        let key = Fingerprint::compute("s1", "q", &[file("f1", "v1")]);
        assert!(cache.get(&key).await.is_none());
        cache.put(&key, &run()).await;
        assert_eq!(cache.get(&key).await, Some(run()));
    }

    #[tokio::test]
    async fn test_memory_entry_expires() {
        let cache = ResultCache::in_memory(100, Duration::from_millis(50));
        let key = Fingerprint::compute("s1", "q", &[]);
        cache.put(&key, &run()).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_broken_store_degrades_to_miss() {
        let cache = ResultCache::new(Arc::new(BrokenStore), Duration::from_secs(60));
        let key = Fingerprint::compute("s1", "q", &[]);
        cache.put(&key, &run()).await;
        assert!(cache.get(&key).await.is_none());
    }
}
