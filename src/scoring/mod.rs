//! Incident scoring.
//!
//! Two strategies behind one entry point, [`Scorer::score`]. Which one runs is
//! decided by [`select_strategy`], a pure function over the incident's
//! overflow flag, the global AI switch and the failure breaker. An AI failure
//! falls through to the deterministic formula exactly once, with the reason
//! recorded on the assessment.

pub mod ai;
pub mod breaker;
pub mod deterministic;
pub mod reasoning;

pub use self::ai::{AiScorer, ContextDocument};
pub use self::breaker::{BreakerState, FailureBreaker};
pub use self::deterministic::DeterministicScorer;
pub use self::reasoning::{
    HttpReasoningService, ReasoningError, ReasoningRequest, ReasoningResponse, ReasoningService,
};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ScoringConfig;
use crate::correlate::{Incident, IncidentRecord};
use crate::stats::PipelineStats;
use crate::storage::IncidentArchive;

/// Similar closed incidents included in the AI context.
const SIMILAR_LIMIT: usize = 3;

/// Write-once result of scoring an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub score: f64,
    pub confidence: f64,
    pub explanation: String,
    pub ai_generated: bool,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
    /// Why the deterministic formula was used, when it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<FallbackReason>,
    pub scored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// An event in the incident was rate limited at ingress.
    Overflow,
    /// AI scoring is switched off in configuration.
    Disabled,
    /// The failure breaker is open.
    CircuitOpen,
    Timeout,
    Quota,
    Malformed,
    Transport,
    Unavailable,
}

impl FallbackReason {
    pub const ALL: [FallbackReason; 8] = [
        FallbackReason::Overflow,
        FallbackReason::Disabled,
        FallbackReason::CircuitOpen,
        FallbackReason::Timeout,
        FallbackReason::Quota,
        FallbackReason::Malformed,
        FallbackReason::Transport,
        FallbackReason::Unavailable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FallbackReason::Overflow => "overflow",
            FallbackReason::Disabled => "disabled",
            FallbackReason::CircuitOpen => "circuit_open",
            FallbackReason::Timeout => "timeout",
            FallbackReason::Quota => "quota",
            FallbackReason::Malformed => "malformed",
            FallbackReason::Transport => "transport",
            FallbackReason::Unavailable => "unavailable",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&ReasoningError> for FallbackReason {
    fn from(e: &ReasoningError) -> Self {
        match e {
            ReasoningError::Timeout(_) => FallbackReason::Timeout,
            ReasoningError::Quota => FallbackReason::Quota,
            ReasoningError::Malformed(_) => FallbackReason::Malformed,
            ReasoningError::Transport(_) => FallbackReason::Transport,
            ReasoningError::Unavailable(_) => FallbackReason::Unavailable,
        }
    }
}

/// Which strategy scores an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Ai,
    Deterministic(FallbackReason),
}

/// Pure strategy selection. AI unless it is disabled, the incident contains
/// an overflow event, or the failure breaker is open.
pub fn select_strategy(ai_enabled: bool, any_overflow: bool, breaker_open: bool) -> Strategy {
    if !ai_enabled {
        Strategy::Deterministic(FallbackReason::Disabled)
    } else if any_overflow {
        Strategy::Deterministic(FallbackReason::Overflow)
    } else if breaker_open {
        Strategy::Deterministic(FallbackReason::CircuitOpen)
    } else {
        Strategy::Ai
    }
}

pub struct Scorer {
    ai: Option<AiScorer>,
    deterministic: DeterministicScorer,
    breaker: FailureBreaker,
    archive: Arc<dyn IncidentArchive>,
    stats: Arc<PipelineStats>,
    similar_lookback: Duration,
}

impl Scorer {
    /// `reasoning` is `None` when no reasoning service is wired in; AI is then
    /// treated as disabled regardless of configuration.
    pub fn new(
        cfg: &ScoringConfig,
        reasoning: Option<Arc<dyn ReasoningService>>,
        archive: Arc<dyn IncidentArchive>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let ai = if cfg.ai_enabled {
            reasoning.map(|svc| AiScorer::new(svc, cfg))
        } else {
            None
        };
        Self {
            ai,
            deterministic: DeterministicScorer::new(cfg),
            breaker: FailureBreaker::from_config(cfg),
            archive,
            stats,
            similar_lookback: Duration::hours(cfg.similar_lookback_hours as i64),
        }
    }

    pub fn breaker(&self) -> &FailureBreaker {
        &self.breaker
    }

    /// Score an incident that is in `Scoring`. Never fails.
    pub async fn score(&self, incident: &Incident) -> Assessment {
        let now = Utc::now();
        let strategy = select_strategy(
            self.ai.is_some(),
            incident.has_overflow(),
            self.breaker.is_open_at(now).await,
        );

        let ai = match (strategy, &self.ai) {
            (Strategy::Ai, Some(ai)) => ai,
            (Strategy::Deterministic(reason), _) => {
                debug!(incident_id = %incident.id(), reason = %reason, "scoring deterministically");
                return self.fallback(incident, reason);
            }
            (Strategy::Ai, None) => return self.fallback(incident, FallbackReason::Disabled),
        };

        self.stats.record_ai_attempt();
        let similar = self.similar(incident, now).await;
        match ai.assess(incident, &similar).await {
            Ok(assessment) => {
                self.stats.record_ai_success();
                info!(
                    incident_id = %incident.id(),
                    score = assessment.score,
                    confidence = assessment.confidence,
                    "incident scored by reasoning service"
                );
                assessment
            }
            Err(e) => {
                let reason = FallbackReason::from(&e);
                warn!(
                    incident_id = %incident.id(),
                    error = %e,
                    reason = %reason,
                    "reasoning call failed, falling back to deterministic scoring"
                );
                self.breaker.record_failure_at(Utc::now()).await;
                self.fallback(incident, reason)
            }
        }
    }

    fn fallback(&self, incident: &Incident, reason: FallbackReason) -> Assessment {
        self.stats.record_fallback(reason);
        self.deterministic.assess(incident, reason, Utc::now())
    }

    async fn similar(&self, incident: &Incident, now: DateTime<Utc>) -> Vec<IncidentRecord> {
        let kinds: Vec<String> = incident.kinds().into_iter().collect();
        match self
            .archive
            .similar(
                &incident.spatial_key().to_string(),
                &kinds,
                now - self.similar_lookback,
                SIMILAR_LIMIT,
            )
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(incident_id = %incident.id(), error = %e, "similar-incident lookup failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlate::SpatialKey;
    use crate::event::{Event, Severity, Source, Subject};
    use crate::storage::MemoryArchive;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        result: Result<ReasoningResponse, ReasoningError>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(result: Result<ReasoningResponse, ReasoningError>) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ReasoningService for Scripted {
        async fn assess(&self, _: ReasoningRequest) -> Result<ReasoningResponse, ReasoningError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    struct Hang;

    #[async_trait]
    impl ReasoningService for Hang {
        async fn assess(&self, _: ReasoningRequest) -> Result<ReasoningResponse, ReasoningError> {
            std::future::pending().await
        }
    }

    fn ok_response() -> Result<ReasoningResponse, ReasoningError> {
        Ok(ReasoningResponse {
            score: 0.9,
            confidence: 0.95,
            explanation: "multi-stage intrusion".into(),
            recommended_actions: vec![],
        })
    }

    fn scoring_incident(overflow: bool) -> Incident {
        let mut e = Event::new(
            "e1",
            Source::IntrusionDetector,
            Severity::High,
            "Attempted Administrator Privilege Gain",
            Subject::pair("10.0.0.1", "10.0.0.2"),
            Utc::now(),
        );
        e.overflow = overflow;
        let mut inc = Incident::open(SpatialKey::pair("10.0.0.1", "10.0.0.2"), Arc::new(e));
        inc.begin_scoring().unwrap();
        inc
    }

    fn scorer(cfg: &ScoringConfig, svc: Option<Arc<dyn ReasoningService>>) -> (Scorer, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::default());
        (
            Scorer::new(cfg, svc, Arc::new(MemoryArchive::new()), stats.clone()),
            stats,
        )
    }

    #[test]
    fn test_select_strategy_table() {
        assert_eq!(select_strategy(true, false, false), Strategy::Ai);
        assert_eq!(
            select_strategy(false, true, true),
            Strategy::Deterministic(FallbackReason::Disabled)
        );
        assert_eq!(
            select_strategy(true, true, false),
            Strategy::Deterministic(FallbackReason::Overflow)
        );
        assert_eq!(
            select_strategy(true, false, true),
            Strategy::Deterministic(FallbackReason::CircuitOpen)
        );
    }

    #[tokio::test]
    async fn test_ai_success_path() {
        let svc = Scripted::new(ok_response());
        let (s, stats) = scorer(&ScoringConfig::default(), Some(svc.clone()));
        let a = s.score(&scoring_incident(false)).await;
        assert!(a.ai_generated);
        assert_eq!(a.score, 0.9);
        assert_eq!(svc.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.snapshot().ai_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_falls_back_with_reason() {
        let (s, stats) = scorer(&ScoringConfig::default(), Some(Arc::new(Hang)));
        let a = s.score(&scoring_incident(false)).await;
        assert!(!a.ai_generated);
        assert_eq!(a.fallback_reason, Some(FallbackReason::Timeout));
        assert!((0.0..=1.0).contains(&a.score));
        assert_eq!(stats.snapshot().fallbacks["timeout"], 1);
    }

    #[tokio::test]
    async fn test_overflow_skips_ai_call() {
        let svc = Scripted::new(ok_response());
        let (s, _) = scorer(&ScoringConfig::default(), Some(svc.clone()));
        let a = s.score(&scoring_incident(true)).await;
        assert!(!a.ai_generated);
        assert_eq!(a.fallback_reason, Some(FallbackReason::Overflow));
        assert_eq!(svc.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_skips_ai_call() {
        let svc = Scripted::new(ok_response());
        let cfg = ScoringConfig {
            ai_enabled: false,
            ..ScoringConfig::default()
        };
        let (s, _) = scorer(&cfg, Some(svc.clone()));
        let a = s.score(&scoring_incident(false)).await;
        assert_eq!(a.fallback_reason, Some(FallbackReason::Disabled));
        assert_eq!(svc.calls.load(Ordering::SeqCst), 0);

        let (s, _) = scorer(&ScoringConfig::default(), None);
        let a = s.score(&scoring_incident(false)).await;
        assert_eq!(a.fallback_reason, Some(FallbackReason::Disabled));
    }

    #[tokio::test]
    async fn test_repeated_failures_open_breaker() {
        let svc = Scripted::new(Err(ReasoningError::Quota));
        let cfg = ScoringConfig {
            ai_failure_threshold: 2,
            ..ScoringConfig::default()
        };
        let (s, _) = scorer(&cfg, Some(svc.clone()));

        for _ in 0..3 {
            let a = s.score(&scoring_incident(false)).await;
            assert_eq!(a.fallback_reason, Some(FallbackReason::Quota));
        }
        assert_eq!(svc.calls.load(Ordering::SeqCst), 3);

        // Breaker is open: no further attempt cost.
        let a = s.score(&scoring_incident(false)).await;
        assert_eq!(a.fallback_reason, Some(FallbackReason::CircuitOpen));
        assert_eq!(svc.calls.load(Ordering::SeqCst), 3);
    }
}
