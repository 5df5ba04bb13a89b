//! Health endpoint
//!
//! Reports broker guard state, per-queue depths, and live session
//! statuses in one response.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use super::ApiState;
use crate::broker::{GuardState, QueueCounts};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub broker: GuardState,
    pub queues: Vec<QueueCounts>,
    pub sessions: Vec<SessionStatus>,
}

#[derive(Serialize)]
pub struct SessionStatus {
    pub instance_id: String,
    pub status: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

async fn health(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let broker = state.pipeline.guard().state();
    let queues = state.pipeline.store().counts().unwrap_or_default();
    let sessions = state
        .registry
        .statuses()
        .into_iter()
        .map(|(instance_id, status)| SessionStatus {
            instance_id,
            status: status.as_str().to_owned(),
        })
        .collect();

    let (code, status) = if broker == GuardState::Open {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (StatusCode::OK, "ok")
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            broker,
            queues,
            sessions,
        }),
    )
}
