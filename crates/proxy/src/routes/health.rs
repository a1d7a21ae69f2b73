//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use metamcp_shared::HealthStatus;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub active_connections: usize,
    pub idle_sessions: usize,
    pub metamcp_connections: usize,
    pub client_sessions: usize,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let pool = state.pool.status();
    let metamcp = state.metamcp.status();

    let (overall_status, status) = if pool.shutting_down {
        (StatusCode::SERVICE_UNAVAILABLE, HealthStatus::Degraded)
    } else {
        (StatusCode::OK, HealthStatus::Ok)
    };

    (
        overall_status,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            active_connections: pool.active_connections,
            idle_sessions: pool.idle_sessions + metamcp.idle_sessions,
            metamcp_connections: metamcp.connections,
            client_sessions: state.sessions.len(),
        }),
    )
}

/// Liveness probe (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe (refuses traffic once shutdown has begun)
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.pool.is_shutting_down() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}
