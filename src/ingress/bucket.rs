//! Token bucket guarding the expensive scoring path.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tokio::sync::Mutex;

use crate::config::IngressConfig;
use crate::storage::{from_millis, to_millis, with_conn, Pool, StoreError};

/// Bucket parameters. Tokens are fractional so refill is exact at any tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

/// Stored state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub updated_at: DateTime<Utc>,
}

impl TokenBucket {
    pub fn from_config(cfg: &IngressConfig) -> Self {
        Self {
            capacity: cfg.bucket_capacity as f64,
            refill_per_sec: cfg.refill_per_minute as f64 / 60.0,
        }
    }

    /// A bucket seen for the first time starts full.
    pub fn fresh(&self, now: DateTime<Utc>) -> BucketState {
        BucketState {
            tokens: self.capacity,
            updated_at: now,
        }
    }

    /// Refill for the elapsed time, then take one token if available.
    /// A clock that moves backwards refills nothing.
    pub fn try_take(&self, state: &mut BucketState, now: DateTime<Utc>) -> bool {
        let elapsed = (now - state.updated_at).num_milliseconds().max(0) as f64 / 1000.0;
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if now > state.updated_at {
            state.updated_at = now;
        }
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Take one token from the bucket named `key`. False when it is empty.
    async fn try_acquire(&self, key: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;
}

pub struct MemoryBucketStore {
    bucket: TokenBucket,
    states: Mutex<HashMap<String, BucketState>>,
}

impl MemoryBucketStore {
    pub fn new(bucket: TokenBucket) -> Self {
        Self {
            bucket,
            states: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn try_acquire(&self, key: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut states = self.states.lock().await;
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| self.bucket.fresh(now));
        Ok(self.bucket.try_take(state, now))
    }
}

pub struct SqliteBucketStore {
    bucket: TokenBucket,
    pool: Pool,
}

impl SqliteBucketStore {
    pub fn new(bucket: TokenBucket, pool: Pool) -> Self {
        Self { bucket, pool }
    }
}

#[async_trait]
impl BucketStore for SqliteBucketStore {
    async fn try_acquire(&self, key: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let key = key.to_string();
        let bucket = self.bucket;
        with_conn(&self.pool, move |conn| {
            // IMMEDIATE takes the write lock up front so read-modify-write is atomic
            // across processes.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stored: Option<(f64, i64)> = tx
                .query_row(
                    "SELECT tokens, updated_at FROM token_buckets WHERE bucket_key = ?1",
                    params![key],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let mut state = match stored {
                Some((tokens, updated_at)) => BucketState {
                    tokens,
                    updated_at: from_millis(updated_at),
                },
                None => bucket.fresh(now),
            };
            let granted = bucket.try_take(&mut state, now);
            tx.execute(
                "INSERT INTO token_buckets (bucket_key, tokens, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(bucket_key) DO UPDATE SET tokens = excluded.tokens, updated_at = excluded.updated_at",
                params![key, state.tokens, to_millis(state.updated_at)],
            )?;
            tx.commit()?;
            Ok(granted)
        })
        .await
    }
}
