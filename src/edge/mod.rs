//! Sensor-side half of the pipeline: normalize, queue, forward, and apply
//! sensitivity feedback.

pub mod forwarder;
pub mod queue;
pub mod sensitivity;

pub use self::forwarder::{Backoff, Forwarder, HttpUplink, Uplink, UplinkAck, UplinkBatch, UplinkError};
pub use self::queue::{EdgeQueue, EnqueueOutcome, QueueError};
pub use self::sensitivity::{ApplyOutcome, SensitivityRegistry};

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::normalize::{NormalizeError, Normalizer};

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// What sensors talk to: one call normalizes a raw payload and queues it.
pub struct Edge {
    pub normalizer: Normalizer,
    pub queue: Arc<EdgeQueue>,
    pub sensitivity: Arc<SensitivityRegistry>,
}

impl Edge {
    pub fn new(
        normalizer: Normalizer,
        queue: Arc<EdgeQueue>,
        sensitivity: Arc<SensitivityRegistry>,
    ) -> Self {
        Self {
            normalizer,
            queue,
            sensitivity,
        }
    }

    /// Normalize `raw` with `adapter` and append it to the queue.
    pub async fn accept(&self, adapter: &str, raw: &Value) -> Result<(String, EnqueueOutcome), EdgeError> {
        let event = self.normalizer.normalize(adapter, raw)?;
        let outcome = self.queue.enqueue(&event).await?;
        Ok((event.id, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EdgeConfig;
    use crate::event::Source;
    use serde_json::json;

    fn edge() -> (Edge, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let queue = Arc::new(EdgeQueue::open(&dir.path().join("edge.db"), 10).unwrap());
        let sens = Arc::new(SensitivityRegistry::from_config(&EdgeConfig::default()));
        (Edge::new(Normalizer::with_builtin_adapters(), queue, sens), dir)
    }

    #[tokio::test]
    async fn test_accept_normalizes_and_queues() {
        let (edge, _dir) = edge();
        let raw = json!({
            "timestamp": "2026-03-01T12:00:00.000000+0000",
            "event_type": "alert",
            "src_ip": "203.0.113.7",
            "dest_ip": "10.0.0.9",
            "proto": "TCP",
            "alert": {"signature": "ET SCAN", "category": "Attempted Recon", "severity": 2}
        });
        let (_, outcome) = edge.accept("suricata", &raw).await.unwrap();
        assert!(outcome.is_queued());
        assert_eq!(edge.queue.depths().await.unwrap()[&Source::IntrusionDetector], 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_rejected_and_not_queued() {
        let (edge, _dir) = edge();
        let err = edge.accept("generic", &json!({"type": "x"})).await.unwrap_err();
        assert!(matches!(err, EdgeError::Normalize(_)));
        assert!(matches!(
            edge.accept("nope", &json!({})).await,
            Err(EdgeError::Normalize(NormalizeError::UnknownAdapter(_)))
        ));
        assert_eq!(edge.queue.len().await.unwrap(), 0);
        assert_eq!(edge.normalizer.counts()["generic"].rejected, 1);
    }
}
