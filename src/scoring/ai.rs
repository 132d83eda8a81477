//! AI strategy: builds a bounded context document and asks the reasoning
//! service for an assessment.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::ScoringConfig;
use crate::correlate::{Incident, IncidentRecord};
use crate::event::{EventSummary, Severity, Source};
use crate::scoring::reasoning::{ReasoningError, ReasoningRequest, ReasoningService};
use crate::scoring::Assessment;

/// Rough token estimate used for the context budget.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarIncident {
    pub incident_id: String,
    pub spatial_key: String,
    pub severity: Option<Severity>,
    pub score: Option<f64>,
    pub kinds: Vec<String>,
    pub explanation: Option<String>,
}

impl From<&IncidentRecord> for SimilarIncident {
    fn from(r: &IncidentRecord) -> Self {
        Self {
            incident_id: r.incident_id.clone(),
            spatial_key: r.spatial_key.clone(),
            severity: r.severity,
            score: r.assessment.as_ref().map(|a| a.score),
            kinds: r.kinds.clone(),
            explanation: r.assessment.as_ref().map(|a| a.explanation.clone()),
        }
    }
}

/// Everything the reasoning service sees about one incident.
#[derive(Debug, Clone, Serialize)]
pub struct ContextDocument {
    pub incident_id: String,
    pub spatial_key: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub span_seconds: i64,
    pub event_count: usize,
    pub severity_histogram: BTreeMap<Severity, usize>,
    pub sources: Vec<Source>,
    pub subjects: Vec<String>,
    pub kinds: Vec<String>,
    pub max_model_score: Option<f64>,
    pub events: Vec<EventSummary>,
    pub omitted_events: usize,
    pub similar_incidents: Vec<SimilarIncident>,
}

impl ContextDocument {
    pub fn build(incident: &Incident, similar: &[IncidentRecord]) -> Self {
        Self {
            incident_id: incident.id().to_string(),
            spatial_key: incident.spatial_key().to_string(),
            window_start: incident.window_start(),
            window_end: incident.window_end(),
            span_seconds: (incident.window_end() - incident.window_start()).num_seconds(),
            event_count: incident.events().len(),
            severity_histogram: incident.severity_histogram(),
            sources: incident.sources().into_iter().collect(),
            subjects: incident.subjects(),
            kinds: incident.kinds().into_iter().collect(),
            max_model_score: incident.max_model_score(),
            events: incident.events().iter().map(|e| e.summary()).collect(),
            omitted_events: 0,
            similar_incidents: similar.iter().map(SimilarIncident::from).collect(),
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Serialize within `max_tokens`. Similar incidents go first, then the
    /// event list is halved; the aggregate fields always survive.
    pub fn render(mut self, max_tokens: usize) -> String {
        loop {
            let json = self.to_json();
            if estimate_tokens(&json) <= max_tokens {
                return json;
            }
            if self.similar_incidents.pop().is_some() {
                continue;
            }
            if !self.events.is_empty() {
                let keep = self.events.len() / 2;
                self.omitted_events += self.events.len() - keep;
                self.events.truncate(keep);
                continue;
            }
            // Aggregates alone exceed the budget; hard cut.
            return json.chars().take(max_tokens.saturating_mul(4)).collect();
        }
    }
}

pub struct AiScorer {
    service: Arc<dyn ReasoningService>,
    permits: Semaphore,
    timeout: Duration,
    max_context_tokens: usize,
    max_response_tokens: u32,
}

impl AiScorer {
    pub fn new(service: Arc<dyn ReasoningService>, cfg: &ScoringConfig) -> Self {
        Self {
            service,
            permits: Semaphore::new(cfg.ai_max_concurrent.max(1)),
            timeout: cfg.ai_timeout(),
            max_context_tokens: cfg.ai_max_context_tokens,
            max_response_tokens: cfg.ai_max_response_tokens,
        }
    }

    pub async fn assess(
        &self,
        incident: &Incident,
        similar: &[IncidentRecord],
    ) -> Result<Assessment, ReasoningError> {
        let context = ContextDocument::build(incident, similar).render(self.max_context_tokens);
        let request = ReasoningRequest {
            incident_id: incident.id().to_string(),
            context,
            max_tokens: self.max_response_tokens,
        };

        // One deadline covers the wait for a permit and the call itself.
        let call = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| ReasoningError::Unavailable("reasoning permits closed".into()))?;
            debug!(incident_id = %incident.id(), "calling reasoning service");
            self.service.assess(request).await
        };
        let resp = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ReasoningError::Timeout(self.timeout))??
            .validate()?;

        Ok(Assessment {
            score: resp.score,
            confidence: resp.confidence,
            explanation: resp.explanation,
            ai_generated: true,
            recommended_actions: resp.recommended_actions,
            fallback_reason: None,
            scored_at: Utc::now(),
        })
    }
}
