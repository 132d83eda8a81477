//! Incident lifecycle: `Open -> Scoring -> Scored -> Closed`.
//!
//! Transitions are methods that check the current status and fail with
//! [`IncidentError`] otherwise, so an incident can never be appended to after
//! it leaves `Open` and can never be scored twice.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::CorrelationConfig;
use crate::correlate::SpatialKey;
use crate::event::{Event, EventSummary, Severity, Source};
use crate::scoring::Assessment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Scoring,
    Scored,
    Closed,
}

impl IncidentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Scoring => "scoring",
            IncidentStatus::Scored => "scored",
            IncidentStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IncidentError {
    #[error("incident {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: IncidentStatus,
        to: IncidentStatus,
    },
    #[error("incident {0} is already scored")]
    AlreadyScored(String),
}

/// Grace periods after `window_end`, resolved from configuration.
#[derive(Debug, Clone, Copy)]
pub struct Grace {
    pub normal: Duration,
    pub critical: Duration,
}

impl Grace {
    pub fn from_config(cfg: &CorrelationConfig) -> Self {
        Self {
            normal: Duration::seconds(cfg.grace_sec as i64),
            critical: Duration::seconds(cfg.critical_grace_sec as i64),
        }
    }
}

impl Default for Grace {
    fn default() -> Self {
        Self::from_config(&CorrelationConfig::default())
    }
}

/// A group of related events under one spatial key.
#[derive(Debug, Clone)]
pub struct Incident {
    id: String,
    spatial_key: SpatialKey,
    events: Vec<Arc<Event>>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    status: IncidentStatus,
    assessment: Option<Assessment>,
    closed_at: Option<DateTime<Utc>>,
}

impl Incident {
    /// Open a new incident seeded with its first event.
    pub fn open(spatial_key: SpatialKey, first: Arc<Event>) -> Self {
        let at = first.observed_at;
        Self {
            id: Uuid::new_v4().to_string(),
            spatial_key,
            events: vec![first],
            window_start: at,
            window_end: at,
            status: IncidentStatus::Open,
            assessment: None,
            closed_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spatial_key(&self) -> &SpatialKey {
        &self.spatial_key
    }

    /// Events in arrival order.
    pub fn events(&self) -> &[Arc<Event>] {
        &self.events
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_end
    }

    pub fn status(&self) -> IncidentStatus {
        self.status
    }

    pub fn assessment(&self) -> Option<&Assessment> {
        self.assessment.as_ref()
    }

    pub fn has_critical(&self) -> bool {
        self.events.iter().any(|e| e.severity == Severity::Critical)
    }

    /// True when any member event arrived while the expensive path was rate limited.
    pub fn has_overflow(&self) -> bool {
        self.events.iter().any(|e| e.overflow)
    }

    pub fn grace(&self, grace: &Grace) -> Duration {
        if self.has_critical() {
            grace.critical
        } else {
            grace.normal
        }
    }

    /// Instant after which the sweep claims this incident.
    pub fn expires_at(&self, grace: &Grace) -> DateTime<Utc> {
        self.window_end + self.grace(grace)
    }

    /// Whether an event observed at `observed_at` still belongs here.
    pub fn accepts(&self, observed_at: DateTime<Utc>, grace: &Grace) -> bool {
        self.status == IncidentStatus::Open && observed_at <= self.expires_at(grace)
    }

    pub fn append(&mut self, event: Arc<Event>) -> Result<(), IncidentError> {
        if self.status != IncidentStatus::Open {
            return Err(self.invalid(IncidentStatus::Open));
        }
        self.window_start = self.window_start.min(event.observed_at);
        self.window_end = self.window_end.max(event.observed_at);
        self.events.push(event);
        Ok(())
    }

    pub fn begin_scoring(&mut self) -> Result<(), IncidentError> {
        if self.status != IncidentStatus::Open {
            return Err(self.invalid(IncidentStatus::Scoring));
        }
        self.status = IncidentStatus::Scoring;
        Ok(())
    }

    /// Record the score. Write-once: a second call is rejected and leaves
    /// the first assessment untouched.
    pub fn apply_assessment(&mut self, assessment: Assessment) -> Result<(), IncidentError> {
        match self.status {
            IncidentStatus::Scoring => {
                self.assessment = Some(assessment);
                self.status = IncidentStatus::Scored;
                Ok(())
            }
            IncidentStatus::Scored | IncidentStatus::Closed => {
                Err(IncidentError::AlreadyScored(self.id.clone()))
            }
            IncidentStatus::Open => Err(self.invalid(IncidentStatus::Scored)),
        }
    }

    pub fn close(&mut self, now: DateTime<Utc>) -> Result<(), IncidentError> {
        if self.status != IncidentStatus::Scored {
            return Err(self.invalid(IncidentStatus::Closed));
        }
        self.status = IncidentStatus::Closed;
        self.closed_at = Some(now);
        Ok(())
    }

    fn invalid(&self, to: IncidentStatus) -> IncidentError {
        IncidentError::InvalidTransition {
            id: self.id.clone(),
            from: self.status,
            to,
        }
    }

    // -------- Derived views --------

    pub fn sources(&self) -> BTreeSet<Source> {
        self.events.iter().map(|e| e.source).collect()
    }

    pub fn kinds(&self) -> BTreeSet<String> {
        self.events.iter().map(|e| e.kind.clone()).collect()
    }

    /// Distinct subjects rendered as text, in first-seen order.
    pub fn subjects(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for e in &self.events {
            let s = e.subject.to_string();
            if !seen.contains(&s) {
                seen.push(s);
            }
        }
        seen
    }

    pub fn severity_histogram(&self) -> BTreeMap<Severity, usize> {
        let mut hist = BTreeMap::new();
        for e in &self.events {
            *hist.entry(e.severity).or_insert(0) += 1;
        }
        hist
    }

    pub fn max_severity(&self) -> Severity {
        self.events
            .iter()
            .map(|e| e.severity)
            .max()
            .unwrap_or(Severity::Low)
    }

    pub fn max_model_score(&self) -> Option<f64> {
        self.events
            .iter()
            .filter_map(|e| e.score)
            .fold(None, |acc, s| Some(acc.map_or(s, |a: f64| a.max(s))))
    }

    /// Severity class derived from the score; `None` until scored.
    pub fn severity_class(&self) -> Option<Severity> {
        self.assessment.as_ref().map(|a| Severity::from_score(a.score))
    }

    pub fn record(&self) -> IncidentRecord {
        IncidentRecord {
            incident_id: self.id.clone(),
            spatial_key: self.spatial_key.to_string(),
            status: self.status,
            window_start: self.window_start,
            window_end: self.window_end,
            severity: self.severity_class(),
            assessment: self.assessment.clone(),
            sources: self.sources().into_iter().collect(),
            kinds: self.kinds().into_iter().collect(),
            event_count: self.events.len(),
            events: self.events.iter().map(|e| e.summary()).collect(),
            closed_at: self.closed_at,
        }
    }
}

/// Serializable snapshot of an incident, as archived and served by the query API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub incident_id: String,
    pub spatial_key: String,
    pub status: IncidentStatus,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub severity: Option<Severity>,
    pub assessment: Option<Assessment>,
    pub sources: Vec<Source>,
    pub kinds: Vec<String>,
    pub event_count: usize,
    pub events: Vec<EventSummary>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl IncidentRecord {
    pub fn scored_at(&self) -> Option<DateTime<Utc>> {
        self.assessment.as_ref().map(|a| a.scored_at)
    }
}
