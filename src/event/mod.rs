//! Canonical event record shared by every stage of the pipeline.

pub mod fingerprint;

pub use self::fingerprint::Fingerprint;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown severity '{0}'")]
    Severity(String),
    #[error("unknown source '{0}'")]
    Source(String),
}

/// Ordered severity: `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    /// Weight used by the deterministic scoring formula.
    pub fn weight(self) -> f64 {
        match self {
            Severity::Low => 0.2,
            Severity::Medium => 0.5,
            Severity::High => 0.8,
            Severity::Critical => 1.0,
        }
    }

    /// Classify a 0..1 score into a severity band.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            Severity::Critical
        } else if score >= 0.7 {
            Severity::High
        } else if score >= 0.4 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Integer rank for storage; preserves ordering.
    pub fn rank(self) -> i64 {
        self as i64
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        Self::ALL.get(usize::try_from(rank).ok()?).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "info" | "informational" => Ok(Severity::Low),
            "medium" | "moderate" | "warning" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(ParseError::Severity(other.to_string())),
        }
    }
}

/// Which kind of sensor produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    NetworkMonitor,
    IntrusionDetector,
    AnomalyModel,
    Other,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::NetworkMonitor,
        Source::IntrusionDetector,
        Source::AnomalyModel,
        Source::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Source::NetworkMonitor => "network-monitor",
            Source::IntrusionDetector => "intrusion-detector",
            Source::AnomalyModel => "anomaly-model",
            Source::Other => "other",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|src| src.as_str() == s)
            .ok_or_else(|| ParseError::Source(s.to_string()))
    }
}

/// The assets an observation is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    /// Source asset (usually an IP address).
    pub src: String,
    /// Destination asset, absent for host-only observations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

impl Subject {
    pub fn new(src: impl Into<String>, dst: Option<String>, protocol: Option<String>) -> Self {
        Self {
            src: src.into(),
            dst,
            protocol: protocol.map(|p| p.to_ascii_lowercase()),
        }
    }

    pub fn pair(src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self::new(src, Some(dst.into()), None)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dst {
            Some(dst) => write!(f, "{} -> {}", self.src, dst)?,
            None => write!(f, "{}", self.src)?,
        }
        if let Some(proto) = &self.protocol {
            write!(f, " ({})", proto)?;
        }
        Ok(())
    }
}

/// One normalized observation from a sensor.
///
/// Built by the normalizer, stamped once by the ingress gate (`received_at`,
/// `overflow`), then frozen behind an `Arc` for the rest of its life.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub source: Source,
    pub observed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    pub severity: Severity,
    pub kind: String,
    pub subject: Subject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default)]
    pub payload: BTreeMap<String, serde_json::Value>,
    /// Set by the ingress gate when the expensive path was rate limited.
    #[serde(default)]
    pub overflow: bool,
}

impl Event {
    pub fn new(
        id: impl Into<String>,
        source: Source,
        severity: Severity,
        kind: impl Into<String>,
        subject: Subject,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            observed_at,
            received_at: None,
            severity,
            kind: kind.into(),
            subject,
            score: None,
            payload: BTreeMap::new(),
            overflow: false,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score.clamp(0.0, 1.0));
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Compact view used in query responses and AI context documents.
    pub fn summary(&self) -> EventSummary {
        EventSummary {
            id: self.id.clone(),
            source: self.source,
            severity: self.severity,
            kind: self.kind.clone(),
            subject: self.subject.to_string(),
            observed_at: self.observed_at,
            score: self.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: String,
    pub source: Source,
    pub severity: Severity,
    pub kind: String,
    pub subject: String,
    pub observed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}
