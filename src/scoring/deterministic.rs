//! Deterministic scoring formula. Always succeeds.

use chrono::{DateTime, Utc};

use crate::config::{DeterministicWeights, ScoringConfig};
use crate::correlate::Incident;
use crate::event::Severity;
use crate::scoring::{Assessment, FallbackReason};

/// Per-component values, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Components {
    pub severity: f64,
    pub volume: f64,
    pub diversity: f64,
    pub model: f64,
}

pub struct DeterministicScorer {
    weights: DeterministicWeights,
    confidence: f64,
}

impl DeterministicScorer {
    pub fn new(cfg: &ScoringConfig) -> Self {
        Self {
            weights: cfg.weights.clone(),
            confidence: cfg.deterministic_confidence.clamp(0.0, 1.0),
        }
    }

    pub fn components(&self, incident: &Incident) -> Components {
        let events = incident.events();
        let n = events.len().max(1) as f64;

        let max_w = incident.max_severity().weight();
        let mean_w = events.iter().map(|e| e.severity.weight()).sum::<f64>() / n;
        let severity = 0.6 * max_w + 0.4 * mean_w;

        let saturation = self.weights.volume_saturation.max(1) as f64;
        let volume = ((1.0 + events.len() as f64).ln() / (1.0 + saturation).ln()).min(1.0);

        let diversity = ((incident.sources().len() as f64 - 1.0) / 3.0).clamp(0.0, 1.0);

        let model = incident.max_model_score().unwrap_or(0.0);

        Components {
            severity,
            volume,
            diversity,
            model,
        }
    }

    pub fn score(&self, c: &Components) -> f64 {
        let w = &self.weights;
        let total = w.severity + w.volume + w.diversity + w.model;
        if total <= 0.0 {
            return c.severity.clamp(0.0, 1.0);
        }
        let raw = w.severity * c.severity
            + w.volume * c.volume
            + w.diversity * c.diversity
            + w.model * c.model;
        (raw / total).clamp(0.0, 1.0)
    }

    pub fn assess(
        &self,
        incident: &Incident,
        fallback_reason: FallbackReason,
        now: DateTime<Utc>,
    ) -> Assessment {
        let c = self.components(incident);
        let score = self.score(&c);
        let sources: Vec<&str> = incident.sources().iter().map(|s| s.as_str()).collect();

        let explanation = format!(
            "Deterministic assessment ({}): {} event(s) from {} source(s) [{}], max severity {}. \
             Components: severity {:.2}, volume {:.2}, diversity {:.2}, model {:.2}.",
            fallback_reason,
            incident.events().len(),
            sources.len(),
            sources.join(", "),
            incident.max_severity(),
            c.severity,
            c.volume,
            c.diversity,
            c.model,
        );

        Assessment {
            score,
            confidence: self.confidence,
            explanation,
            ai_generated: false,
            recommended_actions: recommended_actions(incident),
            fallback_reason: Some(fallback_reason),
            scored_at: now,
        }
    }
}

/// Keyword-driven playbook over event kinds plus volume and severity.
pub fn recommended_actions(incident: &Incident) -> Vec<String> {
    let kinds: Vec<String> = incident
        .kinds()
        .into_iter()
        .map(|k| k.to_ascii_lowercase())
        .collect();
    let any = |needles: &[&str]| kinds.iter().any(|k| needles.iter().any(|n| k.contains(n)));

    let mut actions = Vec::new();
    if any(&["malware", "trojan", "virus", "hash"]) {
        actions.push("Perform full system malware scan and isolate affected systems".to_string());
    }
    if any(&["intrusion", "exploit", "attack", "injection", "attempted"]) {
        actions.push("Review firewall rules and network access controls".to_string());
    }
    if any(&["exfil", "leak", "tunnel"]) {
        actions.push("Investigate data access logs and implement DLP controls".to_string());
    }
    if any(&["unauthorized", "brute", "password", "login", "auth"]) {
        actions.push("Review user access permissions and authentication logs".to_string());
    }
    if any(&["scan", "sweep", "probe"]) {
        actions.push("Block or rate-limit the scanning source at the perimeter".to_string());
    }

    if incident.events().len() > 5 {
        actions.push("Consider raising security alert level due to high event volume".to_string());
    }
    let severe = incident
        .events()
        .iter()
        .filter(|e| e.severity >= Severity::High)
        .count();
    if severe > 2 {
        actions.push("Immediate security team escalation recommended".to_string());
    }
    if actions.is_empty() {
        actions.push("Monitor the affected assets for further activity".to_string());
    }
    actions
}
