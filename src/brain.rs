//! Brain orchestrator: ingress gate, correlator, scoring dispatch, reaper,
//! threshold controller and feedback, plus the background loops that drive
//! them.
//!
//! Loops (sweep, reaper, controller, purge) run on one `TaskTracker`, and
//! scoring runs on another. Shutdown stops the loops first, so no incident
//! enters `Scoring` afterwards, then waits for in-flight scoring, which is
//! bounded by the reasoning timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{CardeaConfig, StoreBackend};
use crate::correlate::{Correlator, Incident, IncidentRecord, Placement};
use crate::event::{Event, Source};
use crate::feedback::FeedbackChannel;
use crate::ingress::{GateDecision, IngressGate};
use crate::scoring::{BreakerState, HttpReasoningService, ReasoningService, Scorer};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::storage::{self, IncidentArchive, IncidentQuery, MemoryArchive, SqliteArchive, StoreError};
use crate::threshold::{ThresholdController, ThresholdRecommendation};

/// What happened to one event handed to [`Brain::ingest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Same event id already accepted; nothing done.
    Duplicate,
    /// Fingerprint seen within the dedup window.
    Suppressed,
    Correlated {
        incident_id: String,
        opened: bool,
        overflow: bool,
    },
}

/// Totals for one uplink batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub received: usize,
    pub duplicates: usize,
    pub suppressed: usize,
    pub correlated: usize,
    pub overflowed: usize,
}

/// Body of `GET /api/v1/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct BrainStats {
    #[serde(flatten)]
    pub pipeline: StatsSnapshot,
    pub open_incidents: usize,
    pub retained_incidents: usize,
    pub scoring_in_flight: usize,
    pub breaker: BreakerState,
}

pub struct Brain {
    cfg: CardeaConfig,
    gate: IngressGate,
    correlator: Correlator,
    scorer: Scorer,
    archive: Arc<dyn IncidentArchive>,
    controller: ThresholdController,
    feedback: FeedbackChannel,
    stats: Arc<PipelineStats>,
    /// Accepted `(source, id)` pairs and when they may be forgotten. Ids are
    /// only unique per sensor.
    seen_ids: Mutex<HashMap<(Source, String), DateTime<Utc>>>,
    /// Scored incidents held until the reaper closes them.
    retained: Mutex<HashMap<String, Incident>>,
    loops: TaskTracker,
    scoring: TaskTracker,
    cancel: CancellationToken,
}

impl Brain {
    /// Assemble a brain from parts. `pool` backs the ingress stores when
    /// `ingress.store = "sqlite"`.
    pub fn new(
        cfg: CardeaConfig,
        archive: Arc<dyn IncidentArchive>,
        reasoning: Option<Arc<dyn ReasoningService>>,
        pool: Option<&storage::Pool>,
    ) -> Result<Arc<Self>> {
        cfg.validate().context("invalid brain configuration")?;
        let stats = Arc::new(PipelineStats::default());
        let gate = IngressGate::from_config(&cfg.ingress, pool, stats.clone())?;
        let correlator = Correlator::new(&cfg.correlation);
        let scorer = Scorer::new(&cfg.scoring, reasoning, archive.clone(), stats.clone());
        let controller = ThresholdController::new(cfg.threshold.clone(), archive.clone());

        Ok(Arc::new(Self {
            cfg,
            gate,
            correlator,
            scorer,
            archive,
            controller,
            feedback: FeedbackChannel::default(),
            stats,
            seen_ids: Mutex::new(HashMap::new()),
            retained: Mutex::new(HashMap::new()),
            loops: TaskTracker::new(),
            scoring: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }))
    }

    /// Production wiring: SQLite archive at `storage.brain_db_path`, HTTP
    /// reasoning service when AI scoring is enabled.
    pub fn from_config(cfg: CardeaConfig) -> Result<Arc<Self>> {
        let pool = storage::open_pool(&cfg.storage.brain_db_path).with_context(|| {
            format!(
                "failed to open brain database {}",
                cfg.storage.brain_db_path.display()
            )
        })?;
        let archive: Arc<dyn IncidentArchive> = Arc::new(SqliteArchive::new(pool.clone()));

        let reasoning: Option<Arc<dyn ReasoningService>> = if cfg.scoring.ai_enabled {
            let api_key = std::env::var(&cfg.scoring.ai_api_key_env).ok();
            if api_key.is_none() {
                warn!(
                    env = %cfg.scoring.ai_api_key_env,
                    "no reasoning-service API key in environment, calling without auth"
                );
            }
            Some(Arc::new(HttpReasoningService::new(
                cfg.scoring.ai_endpoint.clone(),
                api_key,
                cfg.scoring.ai_timeout(),
            )?))
        } else {
            info!("AI scoring disabled, all incidents scored deterministically");
            None
        };

        let ingress_pool = match cfg.ingress.store {
            StoreBackend::Sqlite => Some(&pool),
            StoreBackend::Memory => None,
        };
        Self::new(cfg.clone(), archive, reasoning, ingress_pool)
    }

    /// Brain with in-memory stores and no reasoning service.
    pub fn in_memory(cfg: CardeaConfig) -> Result<Arc<Self>> {
        Self::new(cfg, Arc::new(MemoryArchive::new()), None, None)
    }

    pub fn config(&self) -> &CardeaConfig {
        &self.cfg
    }

    pub fn feedback(&self) -> &FeedbackChannel {
        &self.feedback
    }

    pub fn archive(&self) -> &Arc<dyn IncidentArchive> {
        &self.archive
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ---- Ingestion ----

    /// Accept one event. Idempotent per source and event id.
    pub async fn ingest(&self, event: Event, now: DateTime<Utc>) -> IngestOutcome {
        {
            let mut seen = self.seen_ids.lock().await;
            let key = (event.source, event.id.clone());
            if matches!(seen.get(&key), Some(until) if *until > now) {
                debug!(event_id = %event.id, "event id already accepted");
                return IngestOutcome::Duplicate;
            }
            let ttl = Duration::seconds(self.cfg.correlation.retention_sec as i64)
                .max(Duration::seconds(self.cfg.ingress.dedup_window_sec as i64));
            seen.insert(key, now + ttl);
        }

        match self.gate.admit(event, now).await {
            GateDecision::Suppressed { .. } => IngestOutcome::Suppressed,
            GateDecision::Forward(event) => {
                let overflow = event.overflow;
                let placement = self.correlator.ingest(Arc::new(event)).await;
                let opened = matches!(placement, Placement::Opened { .. });
                self.stats.record_correlated(opened);
                IngestOutcome::Correlated {
                    incident_id: placement.incident_id().to_string(),
                    opened,
                    overflow,
                }
            }
        }
    }

    pub async fn ingest_batch(&self, events: Vec<Event>, now: DateTime<Utc>) -> BatchReport {
        let mut report = BatchReport::default();
        for event in events {
            report.received += 1;
            match self.ingest(event, now).await {
                IngestOutcome::Duplicate => report.duplicates += 1,
                IngestOutcome::Suppressed => report.suppressed += 1,
                IngestOutcome::Correlated { overflow, .. } => {
                    report.correlated += 1;
                    if overflow {
                        report.overflowed += 1;
                    }
                }
            }
        }
        report
    }

    // ---- Sweep and scoring ----

    /// Claim every expired open incident and start scoring it. The returned
    /// handles resolve to the scored record, or `None` if it could not be
    /// applied.
    pub async fn sweep_once(
        self: &Arc<Self>,
        now: DateTime<Utc>,
    ) -> Vec<JoinHandle<Option<IncidentRecord>>> {
        let claimed = self.correlator.sweep_at(now).await;
        claimed
            .into_iter()
            .map(|incident| {
                let brain = Arc::clone(self);
                self.scoring.spawn(async move { brain.score_incident(incident).await })
            })
            .collect()
    }

    async fn score_incident(&self, mut incident: Incident) -> Option<IncidentRecord> {
        let assessment = self.scorer.score(&incident).await;
        if let Err(e) = incident.apply_assessment(assessment) {
            error!(incident_id = %incident.id(), error = %e, "could not record assessment");
            return None;
        }
        self.stats.record_scored();
        let record = incident.record();
        if let Err(e) = self.archive.upsert(record.clone()).await {
            warn!(incident_id = %incident.id(), error = %e, "failed to archive scored incident");
        }
        info!(
            incident_id = %record.incident_id,
            spatial_key = %record.spatial_key,
            events = record.event_count,
            severity = ?record.severity,
            "incident scored"
        );
        self.retained
            .lock()
            .await
            .insert(incident.id().to_string(), incident);
        Some(record)
    }

    /// Close and archive scored incidents held longer than the retention.
    pub async fn reap_at(&self, now: DateTime<Utc>) -> usize {
        let retention = Duration::seconds(self.cfg.correlation.retention_sec as i64);
        let due: Vec<Incident> = {
            let mut retained = self.retained.lock().await;
            let ids: Vec<String> = retained
                .iter()
                .filter(|(_, inc)| {
                    inc.assessment()
                        .map_or(false, |a| now >= a.scored_at + retention)
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| retained.remove(id)).collect()
        };

        let mut closed = 0;
        for mut incident in due {
            if let Err(e) = incident.close(now) {
                warn!(incident_id = %incident.id(), error = %e, "could not close incident");
                continue;
            }
            if let Err(e) = self.archive.upsert(incident.record()).await {
                warn!(incident_id = %incident.id(), error = %e, "failed to archive closed incident");
            }
            self.stats.record_closed();
            closed += 1;
        }
        if closed > 0 {
            info!(closed, "reaper closed incidents");
        }

        self.seen_ids.lock().await.retain(|_, until| *until > now);
        closed
    }

    // ---- Threshold feedback ----

    /// Seed the controller and feedback channel from archived recommendations.
    pub async fn restore_feedback(&self) -> Result<usize, StoreError> {
        let restored = self.controller.restore().await?;
        let n = restored.len();
        for rec in restored {
            self.feedback.publish(rec).await;
        }
        Ok(n)
    }

    pub async fn run_controller_at(&self, now: DateTime<Utc>) -> Vec<ThresholdRecommendation> {
        let recs = self.controller.run_cycle(now).await;
        for rec in &recs {
            self.feedback.publish(rec.clone()).await;
        }
        recs
    }

    pub async fn purge_at(&self, now: DateTime<Utc>) -> usize {
        match self.gate.dedup_store().purge_expired(now).await {
            Ok(n) => {
                if n > 0 {
                    debug!(purged = n, "purged expired dedup entries");
                }
                n
            }
            Err(e) => {
                warn!(error = %e, "dedup purge failed");
                0
            }
        }
    }

    // ---- Queries ----

    pub async fn incidents(&self, query: IncidentQuery) -> Result<Vec<IncidentRecord>, StoreError> {
        self.archive.query(query).await
    }

    pub async fn stats(&self) -> BrainStats {
        BrainStats {
            pipeline: self.stats.snapshot(),
            open_incidents: self.correlator.open_count().await,
            retained_incidents: self.retained.lock().await.len(),
            scoring_in_flight: self.scoring.len(),
            breaker: self.scorer.breaker().state_at(Utc::now()).await,
        }
    }

    // ---- Lifecycle ----

    /// Start the background loops. Returns immediately.
    pub async fn start(self: &Arc<Self>) {
        match self.restore_feedback().await {
            Ok(n) if n > 0 => info!(targets = n, "restored threshold feedback"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not restore threshold feedback"),
        }

        let corr = &self.cfg.correlation;
        self.spawn_loop("sweep", corr.sweep_interval_sec, |brain| async move {
            brain.sweep_once(Utc::now()).await;
        });
        self.spawn_loop("reaper", corr.sweep_interval_sec, |brain| async move {
            brain.reap_at(Utc::now()).await;
        });
        self.spawn_loop("controller", self.cfg.threshold.period_sec, |brain| async move {
            brain.run_controller_at(Utc::now()).await;
        });
        self.spawn_loop("dedup-purge", self.cfg.ingress.purge_interval_sec, |brain| async move {
            brain.purge_at(Utc::now()).await;
        });
        info!(
            sweep_sec = corr.sweep_interval_sec,
            grace_sec = corr.grace_sec,
            critical_grace_sec = corr.critical_grace_sec,
            "brain started"
        );
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, name: &'static str, every_sec: u64, tick: F)
    where
        F: Fn(Arc<Brain>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let brain = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = StdDuration::from_secs(every_sec.max(1));
        self.loops.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => tick(Arc::clone(&brain)).await,
                }
            }
            debug!(task = name, "loop stopped");
        });
    }

    /// Stop the loops, then wait for in-flight scoring to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.loops.close();
        self.loops.wait().await;

        let in_flight = self.scoring.len();
        if in_flight > 0 {
            info!(in_flight, "waiting for in-flight scoring");
        }
        self.scoring.close();
        self.scoring.wait().await;

        let open = self.correlator.open_count().await;
        if open > 0 {
            warn!(open, "shutting down with open incidents that were never scored");
        }
        info!("brain stopped");
    }
}
