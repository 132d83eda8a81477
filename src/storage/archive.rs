//! Incident archive: scored and closed incidents plus issued threshold
//! recommendations.
//!
//! The brain writes an incident once when it is scored and again when the
//! reaper closes it. The query API, the threshold controller and the AI
//! context builder all read from here.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tokio::sync::RwLock;

use crate::correlate::{IncidentRecord, IncidentStatus};
use crate::event::{Severity, Source};
use crate::storage::{to_millis, with_conn, Pool, StoreError};
use crate::threshold::ThresholdRecommendation;

const DEFAULT_QUERY_LIMIT: usize = 500;

/// Filter for archived incidents. Only `Scored` and `Closed` incidents are
/// ever returned; results are newest-scored first.
#[derive(Debug, Clone, Default)]
pub struct IncidentQuery {
    /// Scored at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Severity class (derived from score) at or above this level.
    pub min_severity: Option<Severity>,
    /// Contains at least one event from this source.
    pub source: Option<Source>,
    /// Zero means the default limit.
    pub limit: usize,
}

impl IncidentQuery {
    fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            DEFAULT_QUERY_LIMIT
        } else {
            self.limit
        }
    }

    fn matches(&self, rec: &IncidentRecord) -> bool {
        if !matches!(rec.status, IncidentStatus::Scored | IncidentStatus::Closed) {
            return false;
        }
        if let Some(since) = self.since {
            if rec.scored_at().map_or(true, |t| t < since) {
                return false;
            }
        }
        if let Some(min) = self.min_severity {
            if rec.severity.map_or(true, |s| s < min) {
                return false;
            }
        }
        if let Some(src) = self.source {
            if !rec.sources.contains(&src) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait IncidentArchive: Send + Sync {
    /// Insert or replace an incident snapshot.
    async fn upsert(&self, record: IncidentRecord) -> Result<(), StoreError>;

    async fn get(&self, incident_id: &str) -> Result<Option<IncidentRecord>, StoreError>;

    async fn query(&self, query: IncidentQuery) -> Result<Vec<IncidentRecord>, StoreError>;

    /// Closed incidents scored since `since` that share the spatial key or
    /// any of `kinds`, newest first.
    async fn similar(
        &self,
        spatial_key: &str,
        kinds: &[String],
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<IncidentRecord>, StoreError>;

    async fn record_recommendation(&self, rec: &ThresholdRecommendation) -> Result<(), StoreError>;

    /// Most recent recommendation for every target that has one.
    async fn latest_recommendations(&self) -> Result<Vec<ThresholdRecommendation>, StoreError>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

pub struct SqliteArchive {
    pool: Pool,
}

impl SqliteArchive {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn decode_records(rows: Vec<String>) -> Result<Vec<IncidentRecord>, StoreError> {
    rows.iter()
        .map(|json| serde_json::from_str(json).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl IncidentArchive for SqliteArchive {
    async fn upsert(&self, record: IncidentRecord) -> Result<(), StoreError> {
        with_conn(&self.pool, move |conn| {
            let json = serde_json::to_string(&record)?;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO incidents (incident_id, spatial_key, status, severity, score,
                    ai_generated, window_start, window_end, scored_at, closed_at, record_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(incident_id) DO UPDATE SET
                    status = excluded.status,
                    severity = excluded.severity,
                    score = excluded.score,
                    ai_generated = excluded.ai_generated,
                    window_start = excluded.window_start,
                    window_end = excluded.window_end,
                    scored_at = excluded.scored_at,
                    closed_at = excluded.closed_at,
                    record_json = excluded.record_json",
                params![
                    record.incident_id,
                    record.spatial_key,
                    record.status.as_str(),
                    record.severity.map(Severity::rank),
                    record.assessment.as_ref().map(|a| a.score),
                    record.assessment.as_ref().map_or(false, |a| a.ai_generated),
                    to_millis(record.window_start),
                    to_millis(record.window_end),
                    record.scored_at().map(to_millis),
                    record.closed_at.map(to_millis),
                    json,
                ],
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO incident_events (incident_id, seq, event_id, source, kind)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (seq, ev) in record.events.iter().enumerate() {
                    stmt.execute(params![
                        record.incident_id,
                        seq as i64,
                        ev.id,
                        ev.source.as_str(),
                        ev.kind
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get(&self, incident_id: &str) -> Result<Option<IncidentRecord>, StoreError> {
        let id = incident_id.to_string();
        let json: Option<String> = with_conn(&self.pool, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT record_json FROM incidents WHERE incident_id = ?1",
                    params![id],
                    |r| r.get(0),
                )
                .optional()?)
        })
        .await?;
        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
            .transpose()
    }

    async fn query(&self, query: IncidentQuery) -> Result<Vec<IncidentRecord>, StoreError> {
        let rows = with_conn(&self.pool, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT record_json FROM incidents i
                 WHERE status IN ('scored', 'closed')
                   AND (?1 IS NULL OR scored_at >= ?1)
                   AND (?2 IS NULL OR severity >= ?2)
                   AND (?3 IS NULL OR EXISTS (
                        SELECT 1 FROM incident_events e
                        WHERE e.incident_id = i.incident_id AND e.source = ?3))
                 ORDER BY scored_at DESC
                 LIMIT ?4",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        query.since.map(to_millis),
                        query.min_severity.map(Severity::rank),
                        query.source.map(Source::as_str),
                        query.effective_limit() as i64,
                    ],
                    |r| r.get::<_, String>(0),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;
        decode_records(rows)
    }

    async fn similar(
        &self,
        spatial_key: &str,
        kinds: &[String],
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<IncidentRecord>, StoreError> {
        let key = spatial_key.to_string();
        let kinds_json = serde_json::to_string(kinds)?;
        let rows = with_conn(&self.pool, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT record_json FROM incidents i
                 WHERE status = 'closed'
                   AND scored_at >= ?1
                   AND (spatial_key = ?2 OR EXISTS (
                        SELECT 1 FROM incident_events e
                        WHERE e.incident_id = i.incident_id
                          AND e.kind IN (SELECT value FROM json_each(?3))))
                 ORDER BY scored_at DESC
                 LIMIT ?4",
            )?;
            let rows = stmt
                .query_map(
                    params![to_millis(since), key, kinds_json, limit as i64],
                    |r| r.get::<_, String>(0),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;
        decode_records(rows)
    }

    async fn record_recommendation(&self, rec: &ThresholdRecommendation) -> Result<(), StoreError> {
        let rec = rec.clone();
        with_conn(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO recommendations (sensor_target, direction, suggested_value, issued_at, record_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    rec.sensor_target,
                    rec.direction.as_str(),
                    rec.suggested_value,
                    to_millis(rec.issued_at),
                    serde_json::to_string(&rec)?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn latest_recommendations(&self) -> Result<Vec<ThresholdRecommendation>, StoreError> {
        let rows = with_conn(&self.pool, |conn| {
            let mut stmt = conn.prepare(
                "SELECT r.record_json FROM recommendations r
                 WHERE r.id = (SELECT r2.id FROM recommendations r2
                               WHERE r2.sensor_target = r.sensor_target
                               ORDER BY r2.issued_at DESC, r2.id DESC LIMIT 1)
                 ORDER BY r.sensor_target",
            )?;
            let rows = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;
        rows.iter()
            .map(|j| serde_json::from_str(j).map_err(StoreError::from))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local archive for tests and single-node runs without a database.
#[derive(Default)]
pub struct MemoryArchive {
    incidents: RwLock<HashMap<String, IncidentRecord>>,
    recommendations: RwLock<Vec<ThresholdRecommendation>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(records: &mut [IncidentRecord]) {
    records.sort_by(|a, b| b.scored_at().cmp(&a.scored_at()));
}

#[async_trait]
impl IncidentArchive for MemoryArchive {
    async fn upsert(&self, record: IncidentRecord) -> Result<(), StoreError> {
        self.incidents
            .write()
            .await
            .insert(record.incident_id.clone(), record);
        Ok(())
    }

    async fn get(&self, incident_id: &str) -> Result<Option<IncidentRecord>, StoreError> {
        Ok(self.incidents.read().await.get(incident_id).cloned())
    }

    async fn query(&self, query: IncidentQuery) -> Result<Vec<IncidentRecord>, StoreError> {
        let mut out: Vec<_> = self
            .incidents
            .read()
            .await
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        newest_first(&mut out);
        out.truncate(query.effective_limit());
        Ok(out)
    }

    async fn similar(
        &self,
        spatial_key: &str,
        kinds: &[String],
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<IncidentRecord>, StoreError> {
        let mut out: Vec<_> = self
            .incidents
            .read()
            .await
            .values()
            .filter(|r| r.status == IncidentStatus::Closed)
            .filter(|r| r.scored_at().map_or(false, |t| t >= since))
            .filter(|r| r.spatial_key == spatial_key || r.kinds.iter().any(|k| kinds.contains(k)))
            .cloned()
            .collect();
        newest_first(&mut out);
        out.truncate(limit);
        Ok(out)
    }

    async fn record_recommendation(&self, rec: &ThresholdRecommendation) -> Result<(), StoreError> {
        self.recommendations.write().await.push(rec.clone());
        Ok(())
    }

    async fn latest_recommendations(&self) -> Result<Vec<ThresholdRecommendation>, StoreError> {
        let mut latest: HashMap<String, ThresholdRecommendation> = HashMap::new();
        for rec in self.recommendations.read().await.iter() {
            let newer = latest
                .get(&rec.sensor_target)
                .map_or(true, |cur| rec.issued_at >= cur.issued_at);
            if newer {
                latest.insert(rec.sensor_target.clone(), rec.clone());
            }
        }
        let mut out: Vec<_> = latest.into_values().collect();
        out.sort_by(|a, b| a.sensor_target.cmp(&b.sensor_target));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlate::{Incident, SpatialKey};
    use crate::event::{Event, Subject};
    use crate::scoring::{Assessment, FallbackReason};
    use crate::threshold::Direction;
    use chrono::Duration;
    use std::sync::Arc;

    fn scored_record(
        src: &str,
        dst: &str,
        kind: &str,
        source: Source,
        score: f64,
        scored_at: DateTime<Utc>,
        close: bool,
    ) -> IncidentRecord {
        let ev = Event::new(
            uuid::Uuid::new_v4().to_string(),
            source,
            Severity::High,
            kind,
            Subject::pair(src, dst),
            scored_at - Duration::seconds(200),
        );
        let mut inc = Incident::open(SpatialKey::pair(src, dst), Arc::new(ev));
        inc.begin_scoring().unwrap();
        inc.apply_assessment(Assessment {
            score,
            confidence: 0.6,
            explanation: "deterministic".into(),
            ai_generated: false,
            recommended_actions: vec!["Monitor".into()],
            fallback_reason: Some(FallbackReason::Disabled),
            scored_at,
        })
        .unwrap();
        if close {
            inc.close(scored_at + Duration::seconds(10)).unwrap();
        }
        inc.record()
    }

    async fn exercise_archive(archive: &dyn IncidentArchive) {
        let now = Utc::now();
        let old = scored_record("a", "b", "scan", Source::NetworkMonitor, 0.3, now - Duration::hours(3), true);
        let hi = scored_record("a", "b", "exfil", Source::IntrusionDetector, 0.85, now - Duration::minutes(5), false);
        let crit = scored_record("c", "d", "scan", Source::AnomalyModel, 0.95, now - Duration::minutes(1), true);
        for r in [&old, &hi, &crit] {
            archive.upsert(r.clone()).await.unwrap();
        }

        let all = archive.query(IncidentQuery::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.incident_id.as_str()).collect();
        assert_eq!(ids, vec![crit.incident_id.as_str(), hi.incident_id.as_str(), old.incident_id.as_str()]);

        let recent = archive
            .query(IncidentQuery {
                since: Some(now - Duration::hours(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);

        let high_plus = archive
            .query(IncidentQuery {
                min_severity: Some(Severity::High),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(high_plus.len(), 2);

        let by_source = archive
            .query(IncidentQuery {
                source: Some(Source::IntrusionDetector),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_source.len(), 1);
        assert_eq!(by_source[0].incident_id, hi.incident_id);

        // Only closed incidents count as similar: `hi` shares the key but is still scored.
        let similar = archive
            .similar("a<->b", &["scan".to_string()], now - Duration::hours(24), 3)
            .await
            .unwrap();
        let ids: Vec<_> = similar.iter().map(|r| r.incident_id.as_str()).collect();
        assert_eq!(ids, vec![crit.incident_id.as_str(), old.incident_id.as_str()]);

        let fetched = archive.get(&hi.incident_id).await.unwrap().unwrap();
        assert_eq!(fetched, hi);
        assert!(archive.get("missing").await.unwrap().is_none());

        // Re-upserting the closed snapshot replaces the scored one.
        let mut closed = hi.clone();
        closed.status = IncidentStatus::Closed;
        closed.closed_at = Some(now);
        archive.upsert(closed).await.unwrap();
        assert_eq!(
            archive.get(&hi.incident_id).await.unwrap().unwrap().status,
            IncidentStatus::Closed
        );
        assert_eq!(archive.query(IncidentQuery::default()).await.unwrap().len(), 3);
    }

    async fn exercise_recommendations(archive: &dyn IncidentArchive) {
        let t0 = Utc::now();
        for (i, value) in [0.95, 0.94, 0.93].into_iter().enumerate() {
            archive
                .record_recommendation(&ThresholdRecommendation {
                    sensor_target: "anomaly-model".into(),
                    direction: Direction::Lower,
                    suggested_value: value,
                    reasoning: "test".into(),
                    confidence: 0.8,
                    issued_at: t0 + Duration::seconds(i as i64),
                })
                .await
                .unwrap();
        }
        archive
            .record_recommendation(&ThresholdRecommendation {
                sensor_target: "intrusion-detector".into(),
                direction: Direction::Maintain,
                suggested_value: 0.95,
                reasoning: "test".into(),
                confidence: 0.8,
                issued_at: t0,
            })
            .await
            .unwrap();

        let latest = archive.latest_recommendations().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].sensor_target, "anomaly-model");
        assert_eq!(latest[0].suggested_value, 0.93);
        assert_eq!(latest[1].direction, Direction::Maintain);
    }

    #[tokio::test]
    async fn test_memory_archive() {
        let archive = MemoryArchive::new();
        exercise_archive(&archive).await;
        exercise_recommendations(&archive).await;
    }

    #[tokio::test]
    async fn test_sqlite_archive() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = crate::storage::open_pool(&dir.path().join("brain.db")).unwrap();
        let archive = SqliteArchive::new(pool);
        exercise_archive(&archive).await;
        exercise_recommendations(&archive).await;
    }

    #[tokio::test]
    async fn test_sqlite_archive_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("brain.db");
        let rec = scored_record("x", "y", "scan", Source::Other, 0.5, Utc::now(), true);
        {
            let archive = SqliteArchive::new(crate::storage::open_pool(&path).unwrap());
            archive.upsert(rec.clone()).await.unwrap();
        }
        let archive = SqliteArchive::new(crate::storage::open_pool(&path).unwrap());
        assert_eq!(archive.get(&rec.incident_id).await.unwrap(), Some(rec));
    }
}
