//! Feedback channel: the latest threshold recommendation per sensor target,
//! readable by polling and pushed to in-process subscribers.

use std::collections::HashMap;

use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::threshold::ThresholdRecommendation;

pub struct FeedbackChannel {
    latest: RwLock<HashMap<String, ThresholdRecommendation>>,
    tx: broadcast::Sender<ThresholdRecommendation>,
}

impl FeedbackChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            latest: RwLock::new(HashMap::new()),
            tx,
        }
    }

    /// Publish a recommendation. Older recommendations than the one on file
    /// for the target are ignored. Returns whether it became the latest.
    pub async fn publish(&self, rec: ThresholdRecommendation) -> bool {
        {
            let mut latest = self.latest.write().await;
            if let Some(cur) = latest.get(&rec.sensor_target) {
                if rec.issued_at < cur.issued_at {
                    debug!(target = %rec.sensor_target, "ignoring out-of-date recommendation");
                    return false;
                }
            }
            latest.insert(rec.sensor_target.clone(), rec.clone());
        }
        // No subscribers is fine; pollers read `latest`.
        let _ = self.tx.send(rec);
        true
    }

    pub async fn latest(&self, target: &str) -> Option<ThresholdRecommendation> {
        self.latest.read().await.get(target).cloned()
    }

    /// Latest recommendation for every target, sorted by target.
    pub async fn all_latest(&self) -> Vec<ThresholdRecommendation> {
        let mut out: Vec<_> = self.latest.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.sensor_target.cmp(&b.sensor_target));
        out
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ThresholdRecommendation> {
        self.tx.subscribe()
    }
}

impl Default for FeedbackChannel {
    fn default() -> Self {
        Self::new(64)
    }
}
