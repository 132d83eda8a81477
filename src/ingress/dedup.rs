//! Fingerprint dedup cache with TTL expiry.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use tokio::sync::Mutex;

use crate::event::Fingerprint;
use crate::storage::{to_millis, with_conn, Pool, StoreError};

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically record `fp` unless a live entry exists. Returns true on the
    /// first sighting within `ttl`, false for a duplicate.
    async fn check_and_set(
        &self,
        fp: &Fingerprint,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Drop entries expired at `now`. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Process-local cache.
#[derive(Default)]
pub struct MemoryDedupStore {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn check_and_set(
        &self,
        fp: &Fingerprint,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        match entries.get(fp.as_str()) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                entries.insert(fp.as_str().to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        Ok(before - entries.len())
    }
}

/// Shared cache in the brain database, so several brain processes agree on
/// what has been seen.
pub struct SqliteDedupStore {
    pool: Pool,
}

impl SqliteDedupStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DedupStore for SqliteDedupStore {
    async fn check_and_set(
        &self,
        fp: &Fingerprint,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let key = fp.as_str().to_string();
        let now_ms = to_millis(now);
        let expires_ms = to_millis(now + ttl);
        with_conn(&self.pool, move |conn| {
            // One statement: insert, or take over an expired row. A live row
            // makes the WHERE fail and nothing changes.
            let changed = conn.execute(
                "INSERT INTO dedup_cache (fingerprint, first_seen, expires_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    first_seen = excluded.first_seen,
                    expires_at = excluded.expires_at
                 WHERE dedup_cache.expires_at <= ?2",
                params![key, now_ms, expires_ms],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let now_ms = to_millis(now);
        with_conn(&self.pool, move |conn| {
            Ok(conn.execute(
                "DELETE FROM dedup_cache WHERE expires_at <= ?1",
                params![now_ms],
            )?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Severity, Source, Subject};
    use std::sync::Arc;

    fn fp(kind: &str) -> Fingerprint {
        let e = Event::new(
            "x",
            Source::IntrusionDetector,
            Severity::High,
            kind,
            Subject::pair("10.0.0.1", "10.0.0.2"),
            Utc::now(),
        );
        Fingerprint::of(&e, 10)
    }

    async fn exercise(store: Arc<dyn DedupStore>) {
        let t0 = Utc::now();
        let ttl = Duration::seconds(60);
        let a = fp("a");

        assert!(store.check_and_set(&a, t0, ttl).await.unwrap());
        assert!(!store.check_and_set(&a, t0 + Duration::seconds(59), ttl).await.unwrap());
        assert!(store.check_and_set(&fp("b"), t0, ttl).await.unwrap());

        // Expired entries are taken over on the next sighting.
        assert!(store.check_and_set(&a, t0 + Duration::seconds(60), ttl).await.unwrap());
        assert!(!store.check_and_set(&a, t0 + Duration::seconds(61), ttl).await.unwrap());

        // `b` expired at t0+60, `a` lives until t0+120.
        assert_eq!(store.purge_expired(t0 + Duration::seconds(90)).await.unwrap(), 1);
    }

    async fn exercise_concurrent(store: Arc<dyn DedupStore>) {
        let now = Utc::now();
        let f = fp("race");
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                store
                    .check_and_set(&f, now, Duration::seconds(60))
                    .await
                    .unwrap()
            }));
        }
        let mut firsts = 0;
        for h in handles {
            if h.await.unwrap() {
                firsts += 1;
            }
        }
        assert_eq!(firsts, 1);
    }

    #[tokio::test]
    async fn test_memory_dedup() {
        exercise(Arc::new(MemoryDedupStore::new())).await;
        exercise_concurrent(Arc::new(MemoryDedupStore::new())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sqlite_dedup() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = crate::storage::open_pool(&dir.path().join("brain.db")).unwrap();
        exercise(Arc::new(SqliteDedupStore::new(pool.clone()))).await;
        exercise_concurrent(Arc::new(SqliteDedupStore::new(pool))).await;
    }

    #[tokio::test]
    async fn test_sqlite_dedup_is_shared_between_instances() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("brain.db");
        let a = SqliteDedupStore::new(crate::storage::open_pool(&path).unwrap());
        let b = SqliteDedupStore::new(crate::storage::open_pool(&path).unwrap());
        let f = fp("shared");
        let now = Utc::now();
        assert!(a.check_and_set(&f, now, Duration::seconds(60)).await.unwrap());
        assert!(!b.check_and_set(&f, now, Duration::seconds(60)).await.unwrap());
    }
}
