//! Namespace front end
//!
//! The same SSE and streamable-HTTP surface as the direct routes, keyed by
//! the API key in the path. Each client session gets its own aggregated
//! backing connection.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{sse::Event, Response, Sse},
    Json,
};
use futures::stream::Stream;
use serde_json::Value;

use super::session::{open_metamcp_session, SessionGuard, SessionMode, SessionScope};
use super::sse::{forward_message, message_stream, MessageQuery};
use super::streamable_http::{end_session, open_stream, post_messages};
use crate::error::ApiResult;
use crate::state::AppState;

/// `GET /metamcp/:api_key/sse`
pub async fn sse(
    State(state): State<AppState>,
    Path(api_key): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>> {
    let session = open_metamcp_session(&state, SessionMode::Sse, &api_key).await?;

    let endpoint = format!("/metamcp/{}/message?sessionId={}", api_key, session.id);
    let guard = SessionGuard::new(state, session.clone());
    message_stream(session, Some(endpoint), Some(guard))
}

/// `POST /metamcp/:api_key/message`
pub async fn post_message(
    State(state): State<AppState>,
    Path(api_key): Path<String>,
    Query(query): Query<MessageQuery>,
    Json(message): Json<Value>,
) -> ApiResult<StatusCode> {
    forward_message(&state, &query.session_id, SessionScope::Namespace(&api_key), message).await
}

/// `POST /metamcp/:api_key/mcp`
pub async fn post(
    State(state): State<AppState>,
    Path(api_key): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let scope = SessionScope::Namespace(&api_key);
    post_messages(&state, &headers, scope, body, || {
        open_metamcp_session(&state, SessionMode::StreamableHttp, &api_key)
    })
    .await
}

/// `GET /metamcp/:api_key/mcp`
pub async fn stream(
    State(state): State<AppState>,
    Path(api_key): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    open_stream(&state, &headers, SessionScope::Namespace(&api_key))
}

/// `DELETE /metamcp/:api_key/mcp`
pub async fn delete(
    State(state): State<AppState>,
    Path(api_key): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    end_session(&state, &headers, SessionScope::Namespace(&api_key)).await
}
