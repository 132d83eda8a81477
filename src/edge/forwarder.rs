//! Uplink forwarder: drains the edge queue to the brain.
//!
//! Single consumer of the queue. Batches are assembled round-robin across
//! sources so one chatty sensor cannot starve the others, and entries are
//! acknowledged only after the brain confirms them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EdgeConfig;
use crate::edge::queue::{EdgeQueue, QueueError, QueuedEvent};
use crate::edge::sensitivity::SensitivityRegistry;
use crate::event::Source;
use crate::threshold::ThresholdRecommendation;

// ---- Wire types ----

/// Body of `POST /api/v1/events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkBatch {
    pub edge_id: String,
    pub entries: Vec<QueuedEvent>,
}

/// Brain response to an uplink batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UplinkAck {
    /// Queue positions the brain has taken responsibility for, duplicates
    /// included. Positions, not event ids, so one acknowledgement can never
    /// remove a different entry that happens to share an id.
    pub acknowledged: Vec<i64>,
    /// Latest recommendation per sensor target.
    #[serde(default)]
    pub recommendations: Vec<ThresholdRecommendation>,
}

/// The brain wraps every response body in `{"data": ..., "meta": ...}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("uplink transport error: {0}")]
    Transport(String),
    #[error("brain returned HTTP {0}")]
    Status(u16),
    #[error("unreadable brain response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Uplink(#[from] UplinkError),
}

#[async_trait]
pub trait Uplink: Send + Sync {
    async fn send(&self, batch: &UplinkBatch) -> Result<UplinkAck, UplinkError>;

    /// Latest recommendation per sensor target.
    async fn fetch_feedback(&self) -> Result<Vec<ThresholdRecommendation>, UplinkError>;
}

// ---- HTTP uplink ----

pub struct HttpUplink {
    client: Client,
    base_url: String,
}

impl HttpUplink {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build uplink HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(cfg: &EdgeConfig) -> Result<Self> {
        Self::new(&cfg.brain_url, Duration::from_secs(cfg.uplink_timeout_sec))
    }

    async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, UplinkError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(UplinkError::Status(status.as_u16()));
        }
        resp.json::<Envelope<T>>()
            .await
            .map(|env| env.data)
            .map_err(|e| UplinkError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Uplink for HttpUplink {
    async fn send(&self, batch: &UplinkBatch) -> Result<UplinkAck, UplinkError> {
        let resp = self
            .client
            .post(format!("{}/api/v1/events", self.base_url))
            .json(batch)
            .send()
            .await
            .map_err(|e| UplinkError::Transport(e.to_string()))?;
        Self::decode(resp).await
    }

    async fn fetch_feedback(&self) -> Result<Vec<ThresholdRecommendation>, UplinkError> {
        let resp = self
            .client
            .get(format!("{}/api/v1/feedback", self.base_url))
            .send()
            .await
            .map_err(|e| UplinkError::Transport(e.to_string()))?;
        Self::decode(resp).await
    }
}

// ---- Backoff ----

/// Exponential backoff with jitter: the n-th delay is drawn from
/// `[cap/2, cap]` where `cap = min(max, base * 2^n)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    pub fn from_config(cfg: &EdgeConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.backoff_base_ms),
            Duration::from_millis(cfg.backoff_max_ms),
        )
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn cap(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let cap = self.cap().as_millis() as u64;
        self.attempt = self.attempt.saturating_add(1);
        let floor = cap / 2;
        Duration::from_millis(rand::thread_rng().gen_range(floor..=cap))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ---- Batch assembly ----

/// Interleave per-source backlogs, one entry per source per turn, starting at
/// `start`, until `limit` entries are taken. Order within a source is kept.
pub fn interleave(mut backlogs: Vec<Vec<QueuedEvent>>, start: usize, limit: usize) -> Vec<QueuedEvent> {
    let n = backlogs.len();
    if n == 0 {
        return Vec::new();
    }
    for b in backlogs.iter_mut() {
        b.reverse();
    }
    let mut out = Vec::with_capacity(limit);
    let mut i = start % n;
    let mut idle = 0;
    while out.len() < limit && idle < n {
        match backlogs[i].pop() {
            Some(e) => {
                out.push(e);
                idle = 0;
            }
            None => idle += 1,
        }
        i = (i + 1) % n;
    }
    out
}

// ---- Forwarder ----

pub struct Forwarder {
    queue: Arc<EdgeQueue>,
    uplink: Arc<dyn Uplink>,
    sensitivity: Arc<SensitivityRegistry>,
    edge_id: String,
    batch_size: usize,
    flush_interval: Duration,
    backoff: Backoff,
    next_source: usize,
}

impl Forwarder {
    pub fn new(
        cfg: &EdgeConfig,
        queue: Arc<EdgeQueue>,
        uplink: Arc<dyn Uplink>,
        sensitivity: Arc<SensitivityRegistry>,
    ) -> Self {
        Self {
            queue,
            uplink,
            sensitivity,
            edge_id: cfg.edge_id.clone(),
            batch_size: cfg.batch_size.max(1),
            flush_interval: Duration::from_millis(cfg.flush_interval_ms.max(1)),
            backoff: Backoff::from_config(cfg),
            next_source: 0,
        }
    }

    /// Send one batch. Returns the number of entries acknowledged; zero when
    /// the queue is empty.
    pub async fn drain_once(&mut self) -> Result<usize, ForwardError> {
        let mut backlogs = Vec::with_capacity(Source::ALL.len());
        for source in Source::ALL {
            backlogs.push(self.queue.peek(source, self.batch_size).await?);
        }
        let batch = interleave(backlogs, self.next_source, self.batch_size);
        self.next_source = (self.next_source + 1) % Source::ALL.len();
        if batch.is_empty() {
            return Ok(0);
        }

        let body = UplinkBatch {
            edge_id: self.edge_id.clone(),
            entries: batch,
        };
        let ack = self.uplink.send(&body).await?;

        // Only positions that were actually sent can be removed.
        let confirmed: HashSet<i64> = ack.acknowledged.iter().copied().collect();
        let seqs: Vec<i64> = body
            .entries
            .iter()
            .map(|q| q.seq)
            .filter(|seq| confirmed.contains(seq))
            .collect();
        let removed = self.queue.ack(&seqs).await?;
        let sent = body.entries.len();
        if seqs.len() < sent {
            warn!(
                sent,
                acknowledged = seqs.len(),
                "brain acknowledged part of the batch, remainder stays queued"
            );
        }
        debug!(sent, acknowledged = removed, "uplink batch delivered");

        if !ack.recommendations.is_empty() {
            self.sensitivity.apply_all(&ack.recommendations, Utc::now()).await;
        }
        Ok(removed)
    }

    /// Drain until cancelled, backing off on failure.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(edge_id = %self.edge_id, batch_size = self.batch_size, "forwarder started");
        while !cancel.is_cancelled() {
            let wait = match self.drain_once().await {
                Ok(0) => {
                    self.backoff.reset();
                    self.flush_interval
                }
                Ok(_) => {
                    self.backoff.reset();
                    continue;
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        error = %e,
                        attempt = self.backoff.attempt(),
                        retry_in_ms = delay.as_millis() as u64,
                        "uplink failed, backing off"
                    );
                    delay
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("forwarder stopped");
    }
}

/// Poll the brain for recommendations every `every` until cancelled.
pub async fn poll_feedback(
    uplink: Arc<dyn Uplink>,
    sensitivity: Arc<SensitivityRegistry>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match uplink.fetch_feedback().await {
            Ok(recs) => {
                let applied = sensitivity.apply_all(&recs, Utc::now()).await;
                debug!(received = recs.len(), applied, "feedback poll complete");
            }
            Err(e) => warn!(error = %e, "feedback poll failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Severity, Subject};
    use crate::threshold::Direction;
    use httpmock::prelude::*;
    use serde_json::json;
    use tokio::sync::Mutex;

    fn event(id: &str, source: Source) -> Event {
        Event::new(
            id,
            source,
            Severity::Medium,
            "test",
            Subject::pair("10.0.0.1", "10.0.0.2"),
            Utc::now(),
        )
    }

    fn queued(seq: i64, id: &str, source: Source) -> QueuedEvent {
        QueuedEvent {
            seq,
            event: event(id, source),
        }
    }

    /// Records batches; fails the first `failures` sends.
    struct FakeUplink {
        failures: Mutex<u32>,
        batches: Mutex<Vec<UplinkBatch>>,
        drop_ids: Vec<String>,
        recommendations: Vec<ThresholdRecommendation>,
    }

    impl FakeUplink {
        fn new(failures: u32) -> Self {
            Self {
                failures: Mutex::new(failures),
                batches: Mutex::new(Vec::new()),
                drop_ids: Vec::new(),
                recommendations: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Uplink for FakeUplink {
        async fn send(&self, batch: &UplinkBatch) -> Result<UplinkAck, UplinkError> {
            let mut failures = self.failures.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(UplinkError::Status(503));
            }
            self.batches.lock().await.push(batch.clone());
            Ok(UplinkAck {
                acknowledged: batch
                    .entries
                    .iter()
                    .filter(|q| !self.drop_ids.contains(&q.event.id))
                    .map(|q| q.seq)
                    .collect(),
                recommendations: self.recommendations.clone(),
            })
        }

        async fn fetch_feedback(&self) -> Result<Vec<ThresholdRecommendation>, UplinkError> {
            Ok(self.recommendations.clone())
        }
    }

    fn edge_cfg(batch_size: usize) -> EdgeConfig {
        EdgeConfig {
            batch_size,
            ..EdgeConfig::default()
        }
    }

    fn setup(batch_size: usize, uplink: Arc<FakeUplink>) -> (Forwarder, Arc<EdgeQueue>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let queue = Arc::new(EdgeQueue::open(&dir.path().join("edge.db"), 100).unwrap());
        let cfg = edge_cfg(batch_size);
        let sens = Arc::new(SensitivityRegistry::from_config(&cfg));
        let fwd = Forwarder::new(&cfg, queue.clone(), uplink, sens);
        (fwd, queue, dir)
    }

    #[test]
    fn test_interleave_round_robin() {
        let backlogs = vec![
            vec![
                queued(1, "a1", Source::NetworkMonitor),
                queued(2, "a2", Source::NetworkMonitor),
                queued(3, "a3", Source::NetworkMonitor),
            ],
            vec![queued(4, "b1", Source::IntrusionDetector)],
            vec![],
            vec![queued(5, "d1", Source::Other), queued(6, "d2", Source::Other)],
        ];
        let ids = |v: Vec<QueuedEvent>| v.into_iter().map(|q| q.event.id).collect::<Vec<_>>();

        assert_eq!(
            ids(interleave(backlogs.clone(), 0, 10)),
            vec!["a1", "b1", "d1", "a2", "d2", "a3"]
        );
        assert_eq!(ids(interleave(backlogs.clone(), 3, 3)), vec!["d1", "a1", "b1"]);
        assert!(interleave(Vec::new(), 0, 10).is_empty());
    }

    #[test]
    fn test_backoff_grows_with_jitter_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(1_000));
        let expected_caps = [100u64, 200, 400, 800, 1_000, 1_000];
        for cap in expected_caps {
            let d = b.next_delay().as_millis() as u64;
            assert!(d >= cap / 2 && d <= cap, "delay {} outside [{}, {}]", d, cap / 2, cap);
        }
        b.reset();
        assert!(b.next_delay() <= Duration::from_millis(100));

        // Large attempt counts do not overflow.
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(60));
        for _ in 0..100 {
            assert!(b.next_delay() <= Duration::from_secs(60));
        }
    }

    #[tokio::test]
    async fn test_drain_acks_only_after_success() {
        let uplink = Arc::new(FakeUplink::new(1));
        let (mut fwd, queue, _dir) = setup(10, uplink.clone());
        queue.enqueue(&event("e1", Source::NetworkMonitor)).await.unwrap();
        queue.enqueue(&event("e2", Source::AnomalyModel)).await.unwrap();

        assert!(matches!(fwd.drain_once().await, Err(ForwardError::Uplink(_))));
        assert_eq!(queue.len().await.unwrap(), 2);

        assert_eq!(fwd.drain_once().await.unwrap(), 2);
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(fwd.drain_once().await.unwrap(), 0);
        assert_eq!(uplink.batches.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unacknowledged_entries_stay_queued() {
        let mut fake = FakeUplink::new(0);
        fake.drop_ids = vec!["e2".into()];
        let (mut fwd, queue, _dir) = setup(10, Arc::new(fake));
        for id in ["e1", "e2", "e3"] {
            queue.enqueue(&event(id, Source::IntrusionDetector)).await.unwrap();
        }
        assert_eq!(fwd.drain_once().await.unwrap(), 2);
        let left = queue.peek(Source::IntrusionDetector, 10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].event.id, "e2");
    }

    /// Acknowledges only entries from one source.
    struct OneSourceUplink(Source);

    #[async_trait]
    impl Uplink for OneSourceUplink {
        async fn send(&self, batch: &UplinkBatch) -> Result<UplinkAck, UplinkError> {
            Ok(UplinkAck {
                acknowledged: batch
                    .entries
                    .iter()
                    .filter(|q| q.event.source == self.0)
                    .map(|q| q.seq)
                    .collect(),
                recommendations: Vec::new(),
            })
        }

        async fn fetch_feedback(&self) -> Result<Vec<ThresholdRecommendation>, UplinkError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_ack_by_position_keeps_entry_sharing_an_id() {
        let dir = tempfile::TempDir::new().unwrap();
        let queue = Arc::new(EdgeQueue::open(&dir.path().join("edge.db"), 100).unwrap());
        let cfg = edge_cfg(10);
        let sens = Arc::new(SensitivityRegistry::from_config(&cfg));
        let mut fwd = Forwarder::new(
            &cfg,
            queue.clone(),
            Arc::new(OneSourceUplink(Source::NetworkMonitor)),
            sens,
        );
        queue.enqueue(&event("7", Source::NetworkMonitor)).await.unwrap();
        queue.enqueue(&event("7", Source::AnomalyModel)).await.unwrap();

        assert_eq!(fwd.drain_once().await.unwrap(), 1);
        assert!(queue.peek(Source::NetworkMonitor, 10).await.unwrap().is_empty());
        let left = queue.peek(Source::AnomalyModel, 10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].event.id, "7");
    }

    #[tokio::test]
    async fn test_batches_respect_size_and_share_sources() {
        let uplink = Arc::new(FakeUplink::new(0));
        let (mut fwd, queue, _dir) = setup(4, uplink.clone());
        for i in 0..6 {
            queue
                .enqueue(&event(&format!("nm{}", i), Source::NetworkMonitor))
                .await
                .unwrap();
        }
        queue.enqueue(&event("ids0", Source::IntrusionDetector)).await.unwrap();

        assert_eq!(fwd.drain_once().await.unwrap(), 4);
        let first = uplink.batches.lock().await[0].clone();
        assert!(first.entries.iter().any(|q| q.event.id == "ids0"));
        assert_eq!(first.edge_id, "edge-01");
        assert_eq!(fwd.drain_once().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_ack_recommendations_are_applied() {
        let mut fake = FakeUplink::new(0);
        fake.recommendations = vec![ThresholdRecommendation {
            sensor_target: "intrusion-detector".into(),
            direction: Direction::Raise,
            suggested_value: 0.96,
            reasoning: "noisy".into(),
            confidence: 0.8,
            issued_at: Utc::now(),
        }];
        let dir = tempfile::TempDir::new().unwrap();
        let queue = Arc::new(EdgeQueue::open(&dir.path().join("edge.db"), 100).unwrap());
        let cfg = edge_cfg(10);
        let sens = Arc::new(SensitivityRegistry::from_config(&cfg));
        let mut fwd = Forwarder::new(&cfg, queue.clone(), Arc::new(fake), sens.clone());

        queue.enqueue(&event("e1", Source::IntrusionDetector)).await.unwrap();
        fwd.drain_once().await.unwrap();
        assert_eq!(sens.value("intrusion-detector").await, 0.96);
    }

    #[tokio::test]
    async fn test_http_uplink_roundtrip() {
        let server = MockServer::start();
        let post = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v1/events")
                .json_body_partial(r#"{"edge_id":"edge-01"}"#);
            then.status(200)
                .json_body(json!({"data": {"acknowledged": [7], "recommendations": []}}));
        });
        let get = server.mock(|when, then| {
            when.method(GET).path("/api/v1/feedback");
            then.status(200).json_body(json!({
                "data": [{
                    "sensor_target": "anomaly-model",
                    "direction": "LOWER",
                    "suggested_value": 0.94,
                    "reasoning": "x",
                    "confidence": 0.6,
                    "issued_at": "2026-01-01T00:00:00Z"
                }],
                "meta": {"total": 1}
            }));
        });

        let uplink = HttpUplink::new(server.base_url(), Duration::from_secs(5)).unwrap();
        let ack = uplink
            .send(&UplinkBatch {
                edge_id: "edge-01".into(),
                entries: vec![queued(7, "e1", Source::Other)],
            })
            .await
            .unwrap();
        assert_eq!(ack.acknowledged, vec![7]);
        post.assert();

        let recs = uplink.fetch_feedback().await.unwrap();
        get.assert();
        assert_eq!(recs[0].direction, Direction::Lower);
    }

    #[tokio::test]
    async fn test_http_uplink_error_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/v1/events");
            then.status(503);
        });
        let uplink = HttpUplink::new(server.base_url(), Duration::from_secs(5)).unwrap();
        let err = uplink
            .send(&UplinkBatch {
                edge_id: "edge-01".into(),
                entries: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, UplinkError::Status(503)));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let uplink = Arc::new(FakeUplink::new(0));
        let (fwd, queue, _dir) = setup(10, uplink.clone());
        queue.enqueue(&event("e1", Source::Other)).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(fwd.run(cancel.clone()));
        for _ in 0..50 {
            if queue.len().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
    }
}
