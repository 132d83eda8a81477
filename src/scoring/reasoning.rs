//! Client for the external reasoning service.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReasoningError {
    #[error("reasoning call timed out after {0:?}")]
    Timeout(Duration),
    #[error("reasoning service quota exhausted")]
    Quota,
    #[error("malformed reasoning response: {0}")]
    Malformed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("reasoning service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasoningRequest {
    pub incident_id: String,
    /// Context document, already truncated to the token budget.
    pub context: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasoningResponse {
    pub score: f64,
    pub confidence: f64,
    pub explanation: String,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
}

impl ReasoningResponse {
    /// Reject answers outside the contract instead of clamping them.
    pub fn validate(self) -> Result<Self, ReasoningError> {
        if !(0.0..=1.0).contains(&self.score) {
            return Err(ReasoningError::Malformed(format!(
                "score {} outside 0..1",
                self.score
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ReasoningError::Malformed(format!(
                "confidence {} outside 0..1",
                self.confidence
            )));
        }
        if self.explanation.trim().is_empty() {
            return Err(ReasoningError::Malformed("empty explanation".into()));
        }
        Ok(self)
    }
}

/// Accepts a context document, returns a score and explanation, or fails.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn assess(&self, request: ReasoningRequest) -> Result<ReasoningResponse, ReasoningError>;
}

/// JSON-over-HTTP reasoning service.
pub struct HttpReasoningService {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpReasoningService {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reasoning HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            timeout,
        })
    }
}

#[async_trait]
impl ReasoningService for HttpReasoningService {
    async fn assess(&self, request: ReasoningRequest) -> Result<ReasoningResponse, ReasoningError> {
        let mut req = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ReasoningError::Timeout(self.timeout)
            } else if e.is_connect() {
                ReasoningError::Unavailable(e.to_string())
            } else {
                ReasoningError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ReasoningError::Quota);
        }
        if status.is_server_error() {
            return Err(ReasoningError::Unavailable(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(ReasoningError::Transport(format!("HTTP {}", status)));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| ReasoningError::Transport(e.to_string()))?;
        let parsed: ReasoningResponse =
            serde_json::from_str(&body).map_err(|e| ReasoningError::Malformed(e.to_string()))?;
        parsed.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn request() -> ReasoningRequest {
        ReasoningRequest {
            incident_id: "inc-1".into(),
            context: "{}".into(),
            max_tokens: 256,
        }
    }

    #[tokio::test]
    async fn test_http_success() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/assess")
                .header("authorization", "Bearer sekrit");
            then.status(200).json_body(json!({
                "score": 0.82,
                "confidence": 0.9,
                "explanation": "lateral movement after scan",
                "recommended_actions": ["Isolate 10.0.0.5"]
            }));
        });

        let svc = HttpReasoningService::new(
            server.url("/v1/assess"),
            Some("sekrit".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let resp = svc.assess(request()).await.unwrap();
        mock.assert();
        assert_eq!(resp.score, 0.82);
        assert_eq!(resp.recommended_actions, vec!["Isolate 10.0.0.5".to_string()]);
    }

    #[tokio::test]
    async fn test_http_status_mapping() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/quota");
            then.status(429);
        });
        server.mock(|when, then| {
            when.method(POST).path("/down");
            then.status(503);
        });
        server.mock(|when, then| {
            when.method(POST).path("/garbage");
            then.status(200).body("not json");
        });
        server.mock(|when, then| {
            when.method(POST).path("/range");
            then.status(200)
                .json_body(json!({"score": 7.0, "confidence": 0.5, "explanation": "x"}));
        });

        let svc = |p: &str| {
            HttpReasoningService::new(server.url(p), None, Duration::from_secs(5)).unwrap()
        };
        assert_eq!(svc("/quota").assess(request()).await, Err(ReasoningError::Quota));
        assert!(matches!(
            svc("/down").assess(request()).await,
            Err(ReasoningError::Unavailable(_))
        ));
        assert!(matches!(
            svc("/garbage").assess(request()).await,
            Err(ReasoningError::Malformed(_))
        ));
        assert!(matches!(
            svc("/range").assess(request()).await,
            Err(ReasoningError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_http_timeout_reports_configured_duration() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/slow");
            then.status(200)
                .delay(Duration::from_secs(3))
                .json_body(json!({"score": 0.5, "confidence": 0.5, "explanation": "late"}));
        });
        let svc =
            HttpReasoningService::new(server.url("/slow"), None, Duration::from_secs(1)).unwrap();
        assert_eq!(
            svc.assess(request()).await,
            Err(ReasoningError::Timeout(Duration::from_secs(1)))
        );
    }

    #[test]
    fn test_validate_rejects_empty_explanation() {
        let r = ReasoningResponse {
            score: 0.5,
            confidence: 0.5,
            explanation: "  ".into(),
            recommended_actions: vec![],
        };
        assert!(r.validate().is_err());
    }
}
