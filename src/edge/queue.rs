//! Durable per-source event queue on the edge.
//!
//! Events are written here as soon as a sensor hands them over and stay until
//! the brain acknowledges them. Each source has its own bounded FIFO inside a
//! single `edge_queue` table. When a source is full, the oldest entry of the
//! lowest severity present makes room, but only if that severity is at or
//! below the incoming event's; otherwise the incoming event is dropped.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::event::{Event, Severity, Source};
use crate::storage::{self, from_millis, to_millis, with_conn, Pool, StoreError};

#[derive(Debug, Error)]
pub enum QueueError {
    /// Disk full. The only fatal-class condition on the edge.
    #[error("edge queue storage exhausted: {0}")]
    StorageExhausted(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueueError {
    fn classify(err: StoreError) -> Self {
        if let StoreError::Sqlite(rusqlite::Error::SqliteFailure(code, msg)) = &err {
            if code.code == ErrorCode::DiskFull {
                let detail = msg.clone().unwrap_or_else(|| code.to_string());
                return QueueError::StorageExhausted(detail);
            }
        }
        QueueError::Store(err)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Queued {
        seq: i64,
    },
    /// Queued after evicting an older entry of equal or lower severity.
    QueuedWithEviction {
        seq: i64,
        evicted_event_id: String,
        evicted_severity: Severity,
    },
    /// The queue is full of entries more severe than this one.
    Dropped {
        lowest_present: Severity,
    },
}

impl EnqueueOutcome {
    pub fn is_queued(&self) -> bool {
        !matches!(self, EnqueueOutcome::Dropped { .. })
    }
}

/// A queued event and its position, used to acknowledge it later. Sent over
/// the uplink as is, so the brain can echo `seq` back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub seq: i64,
    pub event: Event,
}

pub struct EdgeQueue {
    pool: Pool,
    capacity: usize,
}

impl EdgeQueue {
    pub fn new(pool: Pool, capacity: usize) -> Self {
        Self {
            pool,
            capacity: capacity.max(1),
        }
    }

    /// Open (or create) the edge database at `path`.
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        Ok(Self::new(storage::open_pool(path)?, capacity))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `event` to its source's FIFO. Returns promptly; never waits for
    /// the uplink.
    pub async fn enqueue(&self, event: &Event) -> Result<EnqueueOutcome, QueueError> {
        let source = event.source.as_str();
        let severity = event.severity;
        let event_id = event.id.clone();
        let json = serde_json::to_string(event).map_err(StoreError::from)?;
        let capacity = self.capacity as i64;

        let outcome = with_conn(&self.pool, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let depth: i64 = tx.query_row(
                "SELECT COUNT(*) FROM edge_queue WHERE source = ?1",
                params![source],
                |r| r.get(0),
            )?;

            let mut evicted = None;
            if depth >= capacity {
                let victim: Option<(i64, String, i64)> = tx
                    .query_row(
                        "SELECT id, event_id, severity FROM edge_queue
                         WHERE source = ?1 ORDER BY severity ASC, id ASC LIMIT 1",
                        params![source],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                    )
                    .optional()?;
                if let Some((id, victim_event, rank)) = victim {
                    let victim_severity = Severity::from_rank(rank).unwrap_or(Severity::Low);
                    if victim_severity > severity {
                        return Ok(EnqueueOutcome::Dropped {
                            lowest_present: victim_severity,
                        });
                    }
                    tx.execute("DELETE FROM edge_queue WHERE id = ?1", params![id])?;
                    evicted = Some((victim_event, victim_severity));
                }
            }

            tx.execute(
                "INSERT INTO edge_queue (source, severity, event_id, event_json, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![source, severity.rank(), event_id, json, to_millis(Utc::now())],
            )?;
            let seq = tx.last_insert_rowid();
            tx.commit()?;

            Ok(match evicted {
                Some((evicted_event_id, evicted_severity)) => EnqueueOutcome::QueuedWithEviction {
                    seq,
                    evicted_event_id,
                    evicted_severity,
                },
                None => EnqueueOutcome::Queued { seq },
            })
        })
        .await
        .map_err(QueueError::classify);

        match &outcome {
            Ok(EnqueueOutcome::Queued { seq }) => {
                debug!(source = %event.source, event_id = %event.id, seq, "queued event");
            }
            Ok(EnqueueOutcome::QueuedWithEviction {
                evicted_event_id,
                evicted_severity,
                ..
            }) => {
                warn!(
                    source = %event.source,
                    event_id = %event.id,
                    evicted = %evicted_event_id,
                    evicted_severity = %evicted_severity,
                    "queue full, evicted lower-severity entry"
                );
            }
            Ok(EnqueueOutcome::Dropped { lowest_present }) => {
                warn!(
                    source = %event.source,
                    event_id = %event.id,
                    severity = %event.severity,
                    lowest_present = %lowest_present,
                    "queue full of more severe entries, dropped event"
                );
            }
            Err(QueueError::StorageExhausted(detail)) => {
                error!(source = %event.source, event_id = %event.id, detail = %detail, "EDGE QUEUE STORAGE EXHAUSTED");
            }
            Err(e) => error!(source = %event.source, error = %e, "failed to queue event"),
        }
        outcome
    }

    /// Oldest `limit` entries for `source`, without removing them.
    pub async fn peek(&self, source: Source, limit: usize) -> Result<Vec<QueuedEvent>, QueueError> {
        let src = source.as_str();
        let limit = limit as i64;
        let rows: Vec<(i64, String)> = with_conn(&self.pool, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_json FROM edge_queue WHERE source = ?1 ORDER BY id LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![src, limit], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(QueueError::classify)?;

        let mut out = Vec::with_capacity(rows.len());
        for (seq, json) in rows {
            match serde_json::from_str::<Event>(&json) {
                Ok(event) => out.push(QueuedEvent { seq, event }),
                Err(e) => {
                    // Unreadable rows would block the source forever.
                    error!(seq, source = %source, error = %e, "dropping unreadable queue entry");
                    self.ack(&[seq]).await?;
                }
            }
        }
        Ok(out)
    }

    /// Remove acknowledged entries. Returns how many rows were deleted.
    pub async fn ack(&self, seqs: &[i64]) -> Result<usize, QueueError> {
        if seqs.is_empty() {
            return Ok(0);
        }
        let seqs = seqs.to_vec();
        with_conn(&self.pool, move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            {
                let mut stmt = tx.prepare("DELETE FROM edge_queue WHERE id = ?1")?;
                for seq in &seqs {
                    removed += stmt.execute(params![seq])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
        .map_err(QueueError::classify)
    }

    /// Queued entries per source. Sources with nothing queued are reported as 0.
    pub async fn depths(&self) -> Result<BTreeMap<Source, usize>, QueueError> {
        let rows: Vec<(String, i64)> = with_conn(&self.pool, |conn| {
            let mut stmt =
                conn.prepare("SELECT source, COUNT(*) FROM edge_queue GROUP BY source")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(QueueError::classify)?;

        let mut out: BTreeMap<Source, usize> = Source::ALL.iter().map(|s| (*s, 0)).collect();
        for (source, n) in rows {
            match source.parse::<Source>() {
                Ok(s) => {
                    out.insert(s, n as usize);
                }
                Err(_) => warn!(source = %source, "unknown source in edge queue"),
            }
        }
        Ok(out)
    }

    pub async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.depths().await?.values().sum())
    }

    /// Enqueue time of the oldest entry, for health reporting.
    pub async fn oldest_enqueued_at(&self) -> Result<Option<chrono::DateTime<Utc>>, QueueError> {
        let ms: Option<i64> = with_conn(&self.pool, |conn| {
            Ok(conn.query_row("SELECT MIN(enqueued_at) FROM edge_queue", [], |r| r.get(0))?)
        })
        .await
        .map_err(QueueError::classify)?;
        Ok(ms.map(from_millis))
    }
}
