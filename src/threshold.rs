//! Threshold controller: turns recent incident statistics into per-sensor
//! sensitivity recommendations.
//!
//! Each cycle looks at the incidents scored within the lookback that contain
//! events from a target sensor, and applies a small decision table:
//!
//! | rate                  | high/critical fraction     | direction |
//! |-----------------------|----------------------------|-----------|
//! | `< low_rate_floor`    | `> high_fraction_ceiling`  | LOWER     |
//! | `> high_rate_ceiling` | `< low_fraction_floor`     | RAISE     |
//! | otherwise             |                            | MAINTAIN  |
//!
//! The first matching row wins. The suggested value never moves more than
//! `max_delta` from the previous one.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::ThresholdConfig;
use crate::event::{Severity, Source};
use crate::storage::{IncidentArchive, IncidentQuery, StoreError};

const MAX_INCIDENTS_PER_CYCLE: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Lower,
    Maintain,
    Raise,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Lower => "LOWER",
            Direction::Maintain => "MAINTAIN",
            Direction::Raise => "RAISE",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable; superseded by the next recommendation for the same target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRecommendation {
    pub sensor_target: String,
    pub direction: Direction,
    pub suggested_value: f64,
    pub reasoning: String,
    pub confidence: f64,
    pub issued_at: DateTime<Utc>,
}

/// What the controller measured for one target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetStats {
    pub incident_count: usize,
    pub rate_per_hour: f64,
    pub high_fraction: f64,
}

pub fn decide(stats: &TargetStats, cfg: &ThresholdConfig) -> Direction {
    if stats.rate_per_hour < cfg.low_rate_floor && stats.high_fraction > cfg.high_fraction_ceiling {
        Direction::Lower
    } else if stats.rate_per_hour > cfg.high_rate_ceiling
        && stats.high_fraction < cfg.low_fraction_floor
    {
        Direction::Raise
    } else {
        Direction::Maintain
    }
}

/// Next value for `direction`, bounded to `prior ± max_delta` and to [0, 1].
///
/// A prior outside [0, 1] is held rather than snapped into range, and a
/// non-finite bound means no movement.
pub fn suggest(prior: f64, direction: Direction, cfg: &ThresholdConfig) -> f64 {
    if !(0.0..=1.0).contains(&prior) {
        return prior;
    }
    let finite_or_zero = |v: f64| if v.is_finite() { v.abs() } else { 0.0 };
    let max_delta = finite_or_zero(cfg.max_delta);
    let step = finite_or_zero(cfg.step).min(max_delta);
    let raw = match direction {
        Direction::Lower => prior - step,
        Direction::Maintain => prior,
        Direction::Raise => prior + step,
    };
    raw.clamp(prior - max_delta, prior + max_delta).clamp(0.0, 1.0)
}

pub struct ThresholdController {
    cfg: ThresholdConfig,
    archive: Arc<dyn IncidentArchive>,
    current: RwLock<HashMap<String, f64>>,
}

impl ThresholdController {
    pub fn new(cfg: ThresholdConfig, archive: Arc<dyn IncidentArchive>) -> Self {
        Self {
            cfg,
            archive,
            current: RwLock::new(HashMap::new()),
        }
    }

    /// Seed current values from the last recommendations on record, so a
    /// restart does not snap every target back to the initial value.
    pub async fn restore(&self) -> Result<Vec<ThresholdRecommendation>, StoreError> {
        let latest = self.archive.latest_recommendations().await?;
        let mut current = self.current.write().await;
        for rec in &latest {
            current.insert(rec.sensor_target.clone(), rec.suggested_value);
        }
        if !latest.is_empty() {
            info!(targets = latest.len(), "restored sensitivity values from archive");
        }
        Ok(latest)
    }

    pub async fn current_value(&self, target: &str) -> f64 {
        self.current
            .read()
            .await
            .get(target)
            .copied()
            .unwrap_or(self.cfg.initial_value)
    }

    pub async fn measure(&self, source: Source, now: DateTime<Utc>) -> Result<TargetStats, StoreError> {
        let lookback = Duration::seconds(self.cfg.lookback_sec.max(1) as i64);
        let incidents = self
            .archive
            .query(IncidentQuery {
                since: Some(now - lookback),
                source: Some(source),
                limit: MAX_INCIDENTS_PER_CYCLE,
                ..IncidentQuery::default()
            })
            .await?;

        let n = incidents.len();
        let high = incidents
            .iter()
            .filter(|r| r.severity.map_or(false, |s| s >= Severity::High))
            .count();
        let hours = self.cfg.lookback_sec.max(1) as f64 / 3600.0;
        Ok(TargetStats {
            incident_count: n,
            rate_per_hour: n as f64 / hours,
            high_fraction: if n == 0 { 0.0 } else { high as f64 / n as f64 },
        })
    }

    pub async fn evaluate(
        &self,
        target: &str,
        now: DateTime<Utc>,
    ) -> Result<ThresholdRecommendation, StoreError> {
        let prior = self.current_value(target).await;
        let stats = match target.parse::<Source>() {
            Ok(source) => self.measure(source, now).await?,
            Err(_) => {
                warn!(target, "unknown sensor target, holding value");
                TargetStats {
                    incident_count: 0,
                    rate_per_hour: 0.0,
                    high_fraction: 0.0,
                }
            }
        };

        let direction = decide(&stats, &self.cfg);
        let suggested_value = suggest(prior, direction, &self.cfg);
        let reasoning = format!(
            "{} incident(s) in the last {}s ({:.1}/h), {:.0}% high or critical; {} from {:.3} to {:.3}",
            stats.incident_count,
            self.cfg.lookback_sec,
            stats.rate_per_hour,
            stats.high_fraction * 100.0,
            direction,
            prior,
            suggested_value,
        );
        let confidence = 0.5 + 0.4 * (stats.incident_count as f64 / 20.0).min(1.0);

        self.current
            .write()
            .await
            .insert(target.to_string(), suggested_value);

        let rec = ThresholdRecommendation {
            sensor_target: target.to_string(),
            direction,
            suggested_value,
            reasoning,
            confidence,
            issued_at: now,
        };
        if let Err(e) = self.archive.record_recommendation(&rec).await {
            warn!(target, error = %e, "failed to archive recommendation");
        }
        info!(
            target,
            direction = %rec.direction,
            value = rec.suggested_value,
            rate = stats.rate_per_hour,
            high_fraction = stats.high_fraction,
            "issued threshold recommendation"
        );
        Ok(rec)
    }

    /// One controller cycle over every configured target.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Vec<ThresholdRecommendation> {
        let mut out = Vec::with_capacity(self.cfg.targets.len());
        for target in &self.cfg.targets {
            match self.evaluate(target, now).await {
                Ok(rec) => out.push(rec),
                Err(e) => warn!(target = %target, error = %e, "threshold evaluation failed"),
            }
        }
        out
    }
}
