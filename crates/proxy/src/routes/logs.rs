//! Server log endpoints

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use metamcp_shared::ServerLogEvent;
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub limit: Option<usize>,
}

/// `GET /api/logs`
pub async fn list(State(state): State<AppState>, Query(query): Query<LogQuery>) -> Json<Vec<ServerLogEvent>> {
    Json(state.logs.recent(query.limit))
}

/// `DELETE /api/logs`
pub async fn clear(State(state): State<AppState>) -> StatusCode {
    state.logs.clear();
    StatusCode::NO_CONTENT
}

/// `GET /api/logs/stream`
pub async fn stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let stream = BroadcastStream::new(state.logs.subscribe()).filter_map(|result| match result {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(json) => Some(Ok(Event::default().event("log").data(json))),
            Err(e) => {
                tracing::warn!("Failed to serialize log event: {}", e);
                None
            }
        },
        Err(e) => {
            tracing::debug!("Log stream lagged: {}", e);
            None
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("ping"),
    )
}
