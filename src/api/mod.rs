//! API layer -- axum routers for the brain and edge daemons.
//!
//! Every body is wrapped as `{"data": ..., "meta": ...}`; errors as
//! `{"error": {"message": ...}}` with a matching status code.

mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use self::state::{BrainState, EdgeState};

/// Brain router: uplink, query, feedback, health and stats.
pub fn brain_router(state: BrainState) -> Router {
    Router::new()
        .nest("/api/v1", routes::brain_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Edge router: sensor intake, applied sensitivity and health.
pub fn edge_router(state: EdgeState) -> Router {
    Router::new()
        .nest("/api/v1", routes::edge_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "not found")
}

pub(crate) fn envelope<T: Serialize>(data: T, meta: Value) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta }))
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": { "message": self.message } })),
        )
            .into_response()
    }
}
