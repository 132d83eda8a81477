//! Sensitivity values applied on the edge, driven by brain recommendations.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::EdgeConfig;
use crate::threshold::{Direction, ThresholdRecommendation};

/// Assumed for a target until the brain says otherwise.
pub const DEFAULT_SENSITIVITY: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedSensitivity {
    /// Value in force after clamping.
    pub value: f64,
    /// Value the brain asked for.
    pub requested: f64,
    pub direction: Direction,
    pub issued_at: DateTime<Utc>,
    pub applied_at: DateTime<Utc>,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// First recommendation for the target.
    Applied { value: f64, clamped: bool },
    /// Replaced an earlier recommendation.
    Superseded {
        previous: f64,
        value: f64,
        clamped: bool,
    },
    /// Not newer than what is in force; ignored.
    Stale,
    /// Non-finite value; ignored.
    Invalid,
}

pub struct SensitivityRegistry {
    min: f64,
    max: f64,
    applied: RwLock<HashMap<String, AppliedSensitivity>>,
}

impl SensitivityRegistry {
    pub fn new(min: f64, max: f64) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            min,
            max,
            applied: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &EdgeConfig) -> Self {
        Self::new(cfg.sensitivity_min, cfg.sensitivity_max)
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    /// Apply `rec` if it is newer than the one in force for its target.
    pub async fn apply(&self, rec: &ThresholdRecommendation, now: DateTime<Utc>) -> ApplyOutcome {
        if !rec.suggested_value.is_finite() {
            warn!(target = %rec.sensor_target, "ignoring non-finite sensitivity");
            return ApplyOutcome::Invalid;
        }

        let mut applied = self.applied.write().await;
        let previous = applied.get(&rec.sensor_target).map(|a| (a.value, a.issued_at));
        if let Some((_, issued_at)) = previous {
            if rec.issued_at <= issued_at {
                debug!(target = %rec.sensor_target, "recommendation already in force or older");
                return ApplyOutcome::Stale;
            }
        }

        let value = rec.suggested_value.clamp(self.min, self.max);
        let clamped = value != rec.suggested_value;
        if clamped {
            warn!(
                target = %rec.sensor_target,
                requested = rec.suggested_value,
                applied = value,
                "sensitivity clamped to absolute range"
            );
        }
        applied.insert(
            rec.sensor_target.clone(),
            AppliedSensitivity {
                value,
                requested: rec.suggested_value,
                direction: rec.direction,
                issued_at: rec.issued_at,
                applied_at: now,
                reasoning: rec.reasoning.clone(),
            },
        );

        match previous {
            Some((prev, prev_issued)) => {
                info!(
                    target = %rec.sensor_target,
                    direction = %rec.direction,
                    previous = prev,
                    value,
                    previous_issued_at = %prev_issued,
                    issued_at = %rec.issued_at,
                    "sensitivity recommendation superseded"
                );
                ApplyOutcome::Superseded {
                    previous: prev,
                    value,
                    clamped,
                }
            }
            None => {
                info!(
                    target = %rec.sensor_target,
                    direction = %rec.direction,
                    value,
                    "sensitivity recommendation applied"
                );
                ApplyOutcome::Applied { value, clamped }
            }
        }
    }

    /// Apply a batch; returns how many took effect.
    pub async fn apply_all(&self, recs: &[ThresholdRecommendation], now: DateTime<Utc>) -> usize {
        let mut n = 0;
        for rec in recs {
            if matches!(
                self.apply(rec, now).await,
                ApplyOutcome::Applied { .. } | ApplyOutcome::Superseded { .. }
            ) {
                n += 1;
            }
        }
        n
    }

    /// Value in force for `target`.
    pub async fn value(&self, target: &str) -> f64 {
        self.applied
            .read()
            .await
            .get(target)
            .map(|a| a.value)
            .unwrap_or_else(|| DEFAULT_SENSITIVITY.clamp(self.min, self.max))
    }

    pub async fn snapshot(&self) -> BTreeMap<String, AppliedSensitivity> {
        self.applied
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn registry() -> SensitivityRegistry {
        SensitivityRegistry::from_config(&EdgeConfig::default())
    }

    fn rec(value: f64, issued_at: DateTime<Utc>) -> ThresholdRecommendation {
        ThresholdRecommendation {
            sensor_target: "anomaly-model".into(),
            direction: Direction::Lower,
            suggested_value: value,
            reasoning: "quiet but severe".into(),
            confidence: 0.7,
            issued_at,
        }
    }

    #[tokio::test]
    async fn test_default_until_first_recommendation() {
        let reg = registry();
        assert_eq!(reg.value("anomaly-model").await, 0.95);
        assert!(reg.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_latest_supersedes_and_stale_is_ignored() {
        let reg = registry();
        let t0 = Utc::now();
        assert_eq!(
            reg.apply(&rec(0.94, t0), t0).await,
            ApplyOutcome::Applied {
                value: 0.94,
                clamped: false
            }
        );
        assert_eq!(
            reg.apply(&rec(0.93, t0 + Duration::minutes(10)), t0).await,
            ApplyOutcome::Superseded {
                previous: 0.94,
                value: 0.93,
                clamped: false
            }
        );
        // Same recommendation again (push and poll both deliver it).
        assert_eq!(
            reg.apply(&rec(0.93, t0 + Duration::minutes(10)), t0).await,
            ApplyOutcome::Stale
        );
        assert_eq!(reg.apply(&rec(0.99, t0), t0).await, ApplyOutcome::Stale);
        assert_eq!(reg.value("anomaly-model").await, 0.93);
    }

    #[tokio::test]
    async fn test_values_are_clamped_to_absolute_range() {
        let reg = registry();
        let t0 = Utc::now();
        assert_eq!(
            reg.apply(&rec(0.5, t0), t0).await,
            ApplyOutcome::Applied {
                value: 0.80,
                clamped: true
            }
        );
        reg.apply(&rec(1.0, t0 + Duration::seconds(1)), t0).await;
        assert_eq!(reg.value("anomaly-model").await, 0.99);
        let snap = reg.snapshot().await;
        assert_eq!(snap["anomaly-model"].requested, 1.0);

        assert_eq!(
            reg.apply(&rec(f64::NAN, t0 + Duration::seconds(2)), t0).await,
            ApplyOutcome::Invalid
        );
    }

    #[tokio::test]
    async fn test_apply_all_counts_effective() {
        let reg = registry();
        let t0 = Utc::now();
        let mut other = rec(0.9, t0);
        other.sensor_target = "network-monitor".into();
        let n = reg.apply_all(&[rec(0.94, t0), other, rec(0.9, t0)], t0).await;
        assert_eq!(n, 2);
    }
}
