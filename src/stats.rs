//! Pipeline counters, shared by the gate, correlator, scorer and reaper.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::scoring::FallbackReason;

#[derive(Default)]
pub struct PipelineStats {
    events_received: AtomicU64,
    events_suppressed: AtomicU64,
    events_overflowed: AtomicU64,
    events_correlated: AtomicU64,
    incidents_opened: AtomicU64,
    incidents_scored: AtomicU64,
    incidents_closed: AtomicU64,
    ai_attempts: AtomicU64,
    ai_successes: AtomicU64,
    fallbacks: [AtomicU64; FallbackReason::ALL.len()],
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub events_suppressed: u64,
    pub events_overflowed: u64,
    pub events_correlated: u64,
    pub incidents_opened: u64,
    pub incidents_scored: u64,
    pub incidents_closed: u64,
    pub ai_attempts: u64,
    pub ai_successes: u64,
    pub fallbacks: BTreeMap<&'static str, u64>,
}

fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn record_received(&self) {
        bump(&self.events_received);
    }

    pub fn record_suppressed(&self) {
        bump(&self.events_suppressed);
    }

    pub fn record_overflowed(&self) {
        bump(&self.events_overflowed);
    }

    pub fn record_correlated(&self, opened: bool) {
        bump(&self.events_correlated);
        if opened {
            bump(&self.incidents_opened);
        }
    }

    pub fn record_scored(&self) {
        bump(&self.incidents_scored);
    }

    pub fn record_closed(&self) {
        bump(&self.incidents_closed);
    }

    pub fn record_ai_attempt(&self) {
        bump(&self.ai_attempts);
    }

    pub fn record_ai_success(&self) {
        bump(&self.ai_successes);
    }

    pub fn record_fallback(&self, reason: FallbackReason) {
        bump(&self.fallbacks[reason.index()]);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            events_received: load(&self.events_received),
            events_suppressed: load(&self.events_suppressed),
            events_overflowed: load(&self.events_overflowed),
            events_correlated: load(&self.events_correlated),
            incidents_opened: load(&self.incidents_opened),
            incidents_scored: load(&self.incidents_scored),
            incidents_closed: load(&self.incidents_closed),
            ai_attempts: load(&self.ai_attempts),
            ai_successes: load(&self.ai_successes),
            fallbacks: FallbackReason::ALL
                .iter()
                .map(|r| (r.as_str(), load(&self.fallbacks[r.index()])))
                .collect(),
        }
    }
}
