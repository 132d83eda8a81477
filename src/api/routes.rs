//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::{BrainState, EdgeState};
use super::{envelope, ApiError};
use crate::edge::{EdgeError, EnqueueOutcome, QueueError, UplinkAck, UplinkBatch};
use crate::event::{Event, Severity, Source};
use crate::normalize::NormalizeError;
use crate::storage::IncidentQuery;

// ---- Brain ----

pub fn brain_routes() -> Router<BrainState> {
    Router::new()
        .route("/health", get(brain_health))
        .route("/stats", get(brain_stats))
        .route("/events", post(ingest_events))
        .route("/incidents", get(list_incidents))
        .route("/incidents/{id}", get(get_incident))
        .route("/feedback", get(list_feedback))
        .route("/feedback/{target}", get(get_feedback))
}

fn meta_now() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn brain_health() -> Json<Value> {
    envelope(json!({ "status": "ok", "role": "brain" }), meta_now())
}

async fn brain_stats(State(state): State<BrainState>) -> Json<Value> {
    envelope(state.brain.stats().await, meta_now())
}

/// Uplink intake. Idempotent per source and event id; every entry's queue
/// position is echoed back, and the response carries the latest
/// recommendations so the edge does not need a separate poll.
async fn ingest_events(
    State(state): State<BrainState>,
    Json(batch): Json<UplinkBatch>,
) -> Json<Value> {
    let (positions, events): (Vec<i64>, Vec<Event>) = batch
        .entries
        .into_iter()
        .map(|q| (q.seq, q.event))
        .unzip();
    let report = state.brain.ingest_batch(events, Utc::now()).await;
    tracing::debug!(
        edge_id = %batch.edge_id,
        received = report.received,
        suppressed = report.suppressed,
        duplicates = report.duplicates,
        overflowed = report.overflowed,
        "uplink batch ingested"
    );
    let ack = UplinkAck {
        acknowledged: positions,
        recommendations: state.brain.feedback().all_latest().await,
    };
    envelope(
        ack,
        json!({
            "edge_id": batch.edge_id,
            "received": report.received,
            "duplicates": report.duplicates,
            "suppressed": report.suppressed,
            "correlated": report.correlated,
            "overflowed": report.overflowed,
        }),
    )
}

#[derive(Debug, Default, Deserialize)]
struct IncidentParams {
    since: Option<String>,
    severity: Option<String>,
    source: Option<String>,
    limit: Option<usize>,
}

impl IncidentParams {
    fn into_query(self) -> Result<IncidentQuery, ApiError> {
        let bad = |msg: String| ApiError::new(StatusCode::BAD_REQUEST, msg);
        let since = match self.since {
            Some(s) => Some(
                DateTime::parse_from_rfc3339(&s)
                    .map_err(|e| bad(format!("invalid 'since': {}", e)))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        let min_severity = match self.severity {
            Some(s) => Some(s.parse::<Severity>().map_err(|e| bad(e.to_string()))?),
            None => None,
        };
        let source = match self.source {
            Some(s) => Some(s.parse::<Source>().map_err(|e| bad(e.to_string()))?),
            None => None,
        };
        Ok(IncidentQuery {
            since,
            min_severity,
            source,
            limit: self.limit.unwrap_or(0),
        })
    }
}

async fn list_incidents(
    State(state): State<BrainState>,
    Query(params): Query<IncidentParams>,
) -> Result<Json<Value>, ApiError> {
    let query = params.into_query()?;
    let records = state
        .brain
        .incidents(query)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let total = records.len();
    Ok(envelope(records, json!({ "total": total })))
}

async fn get_incident(
    State(state): State<BrainState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.brain.archive().get(&id).await {
        Ok(Some(rec)) => Ok(envelope(rec, meta_now())),
        Ok(None) => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("no incident '{}'", id),
        )),
        Err(e) => Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn list_feedback(State(state): State<BrainState>) -> Json<Value> {
    let recs = state.brain.feedback().all_latest().await;
    let total = recs.len();
    envelope(recs, json!({ "total": total }))
}

async fn get_feedback(
    State(state): State<BrainState>,
    Path(target): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .brain
        .feedback()
        .latest(&target)
        .await
        .map(|rec| envelope(rec, meta_now()))
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("no recommendation for '{}'", target),
            )
        })
}

// ---- Edge ----

pub fn edge_routes() -> Router<EdgeState> {
    Router::new()
        .route("/health", get(edge_health))
        .route("/sensors/{adapter}", post(accept_sensor_record))
        .route("/sensitivity", get(sensitivity))
}

async fn edge_health(State(state): State<EdgeState>) -> Result<Json<Value>, ApiError> {
    let depths = state
        .edge
        .queue
        .depths()
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let oldest = state.edge.queue.oldest_enqueued_at().await.ok().flatten();
    Ok(envelope(
        json!({
            "status": "ok",
            "role": "edge",
            "queue_depth": depths,
            "queue_capacity": state.edge.queue.capacity(),
            "oldest_queued_at": oldest,
            "normalizer": state.edge.normalizer.counts(),
        }),
        meta_now(),
    ))
}

async fn accept_sensor_record(
    State(state): State<EdgeState>,
    Path(adapter): Path<String>,
    Json(raw): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    match state.edge.accept(&adapter, &raw).await {
        Ok((event_id, outcome)) => {
            let (status, body) = match outcome {
                EnqueueOutcome::Queued { seq } => (
                    StatusCode::ACCEPTED,
                    json!({ "event_id": event_id, "outcome": "queued", "seq": seq }),
                ),
                EnqueueOutcome::QueuedWithEviction {
                    seq,
                    evicted_event_id,
                    evicted_severity,
                } => (
                    StatusCode::ACCEPTED,
                    json!({
                        "event_id": event_id,
                        "outcome": "queued_with_eviction",
                        "seq": seq,
                        "evicted_event_id": evicted_event_id,
                        "evicted_severity": evicted_severity,
                    }),
                ),
                EnqueueOutcome::Dropped { lowest_present } => (
                    StatusCode::OK,
                    json!({
                        "event_id": event_id,
                        "outcome": "dropped",
                        "lowest_present": lowest_present,
                    }),
                ),
            };
            Ok((status, envelope(body, meta_now())))
        }
        Err(EdgeError::Normalize(NormalizeError::UnknownAdapter(name))) => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("no adapter registered for '{}'", name),
        )),
        Err(EdgeError::Normalize(e)) => {
            Err(ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))
        }
        Err(EdgeError::Queue(e @ QueueError::StorageExhausted(_))) => {
            Err(ApiError::new(StatusCode::INSUFFICIENT_STORAGE, e.to_string()))
        }
        Err(EdgeError::Queue(e)) => {
            Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

async fn sensitivity(State(state): State<EdgeState>) -> Json<Value> {
    let (min, max) = state.edge.sensitivity.bounds();
    envelope(
        state.edge.sensitivity.snapshot().await,
        json!({ "clamp": [min, max] }),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    use super::*;
    use crate::api::{brain_router, edge_router};
    use crate::brain::Brain;
    use crate::config::{CardeaConfig, EdgeConfig};
    use crate::edge::{Edge, EdgeQueue, SensitivityRegistry};
    use crate::event::Subject;
    use crate::normalize::Normalizer;

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn brain_state() -> BrainState {
        BrainState {
            brain: Brain::in_memory(CardeaConfig::default()).unwrap(),
        }
    }

    fn edge_state() -> (EdgeState, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let queue = Arc::new(EdgeQueue::open(&dir.path().join("edge.db"), 10).unwrap());
        let sens = Arc::new(SensitivityRegistry::from_config(&EdgeConfig::default()));
        let edge = Edge::new(Normalizer::with_builtin_adapters(), queue, sens);
        (
            EdgeState {
                edge: Arc::new(edge),
            },
            dir,
        )
    }

    #[tokio::test]
    async fn test_brain_health() {
        let resp = brain_router(brain_state()).oneshot(get("/api/v1/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["status"], "ok");
        assert_eq!(body["data"]["role"], "brain");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let resp = brain_router(brain_state()).oneshot(get("/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_post_events_echoes_queue_positions() {
        let state = brain_state();
        let event = Event::new(
            "e-1",
            Source::NetworkMonitor,
            Severity::Medium,
            "Scan::Port_Scan",
            Subject::pair("10.0.0.1", "10.0.0.2"),
            Utc::now(),
        );
        let body = json!({
            "edge_id": "edge-01",
            "entries": [{"seq": 11, "event": event.clone()}, {"seq": 12, "event": event}]
        });

        let resp = brain_router(state.clone())
            .oneshot(post_json("/api/v1/events", &body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["acknowledged"], json!([11, 12]));
        assert_eq!(body["meta"]["duplicates"], 1);
        assert_eq!(body["meta"]["correlated"], 1);

        let stats = body_json(
            brain_router(state).oneshot(get("/api/v1/stats")).await.unwrap(),
        )
        .await;
        assert_eq!(stats["data"]["events_correlated"], 1);
        assert_eq!(stats["data"]["breaker"]["open"], false);
    }

    #[tokio::test]
    async fn test_incident_query_validates_params() {
        let router = brain_router(brain_state());
        let resp = router
            .clone()
            .oneshot(get("/api/v1/incidents?severity=urgent"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = router
            .clone()
            .oneshot(get("/api/v1/incidents?since=yesterday"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = router
            .clone()
            .oneshot(get("/api/v1/incidents?since=2026-01-01T00:00:00Z&severity=high"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["meta"]["total"], 0);

        let resp = router.oneshot(get("/api/v1/incidents/missing")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_feedback_endpoints() {
        let state = brain_state();
        state.brain.run_controller_at(Utc::now()).await;

        let router = brain_router(state);
        let all = body_json(router.clone().oneshot(get("/api/v1/feedback")).await.unwrap()).await;
        assert_eq!(all["meta"]["total"], 3);

        let one = body_json(
            router
                .clone()
                .oneshot(get("/api/v1/feedback/anomaly-model"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(one["data"]["direction"], "MAINTAIN");

        let resp = router.oneshot(get("/api/v1/feedback/unknown")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_edge_sensor_intake() {
        let (state, _dir) = edge_state();
        let router = edge_router(state.clone());
        let raw = json!({
            "type": "port_scan",
            "severity": "high",
            "timestamp": "2026-03-01T12:00:00Z",
            "src": "203.0.113.7",
            "dst": "10.0.0.9"
        });

        let resp = router
            .clone()
            .oneshot(post_json("/api/v1/sensors/generic", &raw))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["data"]["outcome"], "queued");

        let resp = router
            .clone()
            .oneshot(post_json("/api/v1/sensors/generic", &json!({"type": "x"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let resp = router
            .clone()
            .oneshot(post_json("/api/v1/sensors/carrier-pigeon", &raw))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let health = body_json(router.clone().oneshot(get("/api/v1/health")).await.unwrap()).await;
        assert_eq!(health["data"]["queue_depth"]["other"], 1);
        assert_eq!(health["data"]["normalizer"]["generic"]["accepted"], 1);
        assert_eq!(health["data"]["normalizer"]["generic"]["rejected"], 1);

        let sens = body_json(router.oneshot(get("/api/v1/sensitivity")).await.unwrap()).await;
        assert_eq!(sens["meta"]["clamp"], json!([0.8, 0.99]));
    }
}
