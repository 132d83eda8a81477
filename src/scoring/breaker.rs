//! Failure circuit breaker for the AI strategy.
//!
//! Keeps a sliding one-minute window of AI failures. More than `threshold`
//! failures inside the window opens the breaker for `cooldown`; while open,
//! strategy selection goes straight to deterministic scoring.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::ScoringConfig;

struct BreakerInner {
    failures: VecDeque<DateTime<Utc>>,
    open_until: Option<DateTime<Utc>>,
    trips: u64,
}

/// Point-in-time view for `/stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerState {
    pub open: bool,
    pub open_until: Option<DateTime<Utc>>,
    pub recent_failures: usize,
    pub trips: u64,
}

pub struct FailureBreaker {
    inner: RwLock<BreakerInner>,
    threshold: u32,
    window: Duration,
    cooldown: Duration,
}

impl FailureBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: RwLock::new(BreakerInner {
                failures: VecDeque::new(),
                open_until: None,
                trips: 0,
            }),
            threshold,
            window: Duration::seconds(60),
            cooldown,
        }
    }

    pub fn from_config(cfg: &ScoringConfig) -> Self {
        Self::new(
            cfg.ai_failure_threshold,
            Duration::seconds(cfg.ai_breaker_cooldown_sec as i64),
        )
    }

    pub async fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        let inner = self.inner.read().await;
        inner.open_until.map_or(false, |until| now < until)
    }

    /// Record one AI failure. Returns true when this failure trips the breaker.
    pub async fn record_failure_at(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.write().await;
        let cutoff = now - self.window;
        while inner.failures.front().map_or(false, |t| *t <= cutoff) {
            inner.failures.pop_front();
        }
        inner.failures.push_back(now);

        let already_open = inner.open_until.map_or(false, |until| now < until);
        if !already_open && inner.failures.len() as u32 > self.threshold {
            let until = now + self.cooldown;
            inner.open_until = Some(until);
            inner.trips += 1;
            inner.failures.clear();
            warn!(
                threshold = self.threshold,
                open_until = %until,
                "AI failure breaker opened, scoring deterministically during cooldown"
            );
            return true;
        }
        false
    }

    pub async fn state_at(&self, now: DateTime<Utc>) -> BreakerState {
        let mut inner = self.inner.write().await;
        if let Some(until) = inner.open_until {
            if now >= until {
                inner.open_until = None;
                info!("AI failure breaker closed after cooldown");
            }
        }
        let cutoff = now - self.window;
        BreakerState {
            open: inner.open_until.is_some(),
            open_until: inner.open_until,
            recent_failures: inner.failures.iter().filter(|t| **t > cutoff).count(),
            trips: inner.trips,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_opens_after_more_than_threshold_failures() {
        let b = FailureBreaker::new(3, Duration::seconds(60));
        let t0 = Utc::now();
        for i in 0..3 {
            assert!(!b.record_failure_at(t0 + Duration::seconds(i)).await);
        }
        assert!(!b.is_open_at(t0 + Duration::seconds(3)).await);

        assert!(b.record_failure_at(t0 + Duration::seconds(4)).await);
        assert!(b.is_open_at(t0 + Duration::seconds(5)).await);
        assert!(b.is_open_at(t0 + Duration::seconds(63)).await);
        assert!(!b.is_open_at(t0 + Duration::seconds(64)).await);
    }

    #[tokio::test]
    async fn test_failures_outside_window_do_not_count() {
        let b = FailureBreaker::new(2, Duration::seconds(60));
        let t0 = Utc::now();
        b.record_failure_at(t0).await;
        b.record_failure_at(t0 + Duration::seconds(10)).await;
        // The first two have aged out of the one-minute window.
        assert!(!b.record_failure_at(t0 + Duration::seconds(75)).await);
        assert!(!b.is_open_at(t0 + Duration::seconds(76)).await);
    }

    #[tokio::test]
    async fn test_state_reports_trips_and_closes() {
        let b = FailureBreaker::new(0, Duration::seconds(30));
        let t0 = Utc::now();
        assert!(b.record_failure_at(t0).await);

        let open = b.state_at(t0 + Duration::seconds(1)).await;
        assert!(open.open);
        assert_eq!(open.trips, 1);

        let closed = b.state_at(t0 + Duration::seconds(31)).await;
        assert!(!closed.open);
        assert_eq!(closed.trips, 1);
    }
}
