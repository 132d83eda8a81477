//! Ingress gate: deduplication, then the expensive-path token bucket.
//!
//! The two stages are independent. A duplicate never consumes a token, and
//! a rate-limited event is still forwarded, flagged `overflow` so that its
//! incident is scored deterministically.

pub mod bucket;
pub mod dedup;

pub use self::bucket::{BucketStore, MemoryBucketStore, SqliteBucketStore, TokenBucket};
pub use self::dedup::{DedupStore, MemoryDedupStore, SqliteDedupStore};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::config::{IngressConfig, StoreBackend};
use crate::event::{Event, Fingerprint};
use crate::stats::PipelineStats;
use crate::storage::Pool;

/// Bucket key for the correlate-and-score stage.
pub const EXPENSIVE_PATH: &str = "scoring";

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Seen within the dedup window; dropped.
    Suppressed { fingerprint: Fingerprint },
    /// Stamped with `received_at` and `overflow`, ready for the correlator.
    Forward(Event),
}

pub struct IngressGate {
    dedup: Arc<dyn DedupStore>,
    buckets: Arc<dyn BucketStore>,
    dedup_window: Duration,
    fingerprint_bucket_sec: u64,
    stats: Arc<PipelineStats>,
}

impl IngressGate {
    pub fn new(
        cfg: &IngressConfig,
        dedup: Arc<dyn DedupStore>,
        buckets: Arc<dyn BucketStore>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            dedup,
            buckets,
            dedup_window: Duration::seconds(cfg.dedup_window_sec as i64),
            fingerprint_bucket_sec: cfg.fingerprint_bucket_sec,
            stats,
        }
    }

    /// Build the configured store backend. `pool` is required for `sqlite`.
    pub fn from_config(
        cfg: &IngressConfig,
        pool: Option<&Pool>,
        stats: Arc<PipelineStats>,
    ) -> anyhow::Result<Self> {
        let bucket = TokenBucket::from_config(cfg);
        let (dedup, buckets): (Arc<dyn DedupStore>, Arc<dyn BucketStore>) = match cfg.store {
            StoreBackend::Memory => (
                Arc::new(MemoryDedupStore::new()),
                Arc::new(MemoryBucketStore::new(bucket)),
            ),
            StoreBackend::Sqlite => {
                let pool = pool.ok_or_else(|| {
                    anyhow::anyhow!("ingress.store = \"sqlite\" requires a brain database")
                })?;
                (
                    Arc::new(SqliteDedupStore::new(pool.clone())),
                    Arc::new(SqliteBucketStore::new(bucket, pool.clone())),
                )
            }
        };
        info!(backend = ?cfg.store, "ingress gate stores ready");
        Ok(Self::new(cfg, dedup, buckets, stats))
    }

    pub fn dedup_store(&self) -> Arc<dyn DedupStore> {
        Arc::clone(&self.dedup)
    }

    /// Pass one event through both stages.
    ///
    /// Store failures fail open on dedup (a duplicate may slip through) and
    /// closed on the bucket (the event is marked overflow).
    pub async fn admit(&self, mut event: Event, now: DateTime<Utc>) -> GateDecision {
        self.stats.record_received();
        let fingerprint = Fingerprint::of(&event, self.fingerprint_bucket_sec);

        let first = match self
            .dedup
            .check_and_set(&fingerprint, now, self.dedup_window)
            .await
        {
            Ok(first) => first,
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "dedup store failed, forwarding");
                true
            }
        };
        if !first {
            self.stats.record_suppressed();
            debug!(
                fingerprint = %fingerprint,
                event_id = %event.id,
                source = %event.source,
                "suppressed duplicate event"
            );
            return GateDecision::Suppressed { fingerprint };
        }

        let token = match self.buckets.try_acquire(EXPENSIVE_PATH, now).await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "bucket store failed, treating as overflow");
                false
            }
        };

        event.received_at = Some(now);
        event.overflow = !token;
        if event.overflow {
            self.stats.record_overflowed();
            info!(
                event_id = %event.id,
                source = %event.source,
                "expensive path rate limited, event marked overflow"
            );
        }
        GateDecision::Forward(event)
    }
}
