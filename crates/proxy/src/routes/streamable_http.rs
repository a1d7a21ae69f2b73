//! Streamable-HTTP front end
//!
//! `POST /mcp` carries client messages and returns the replies as JSON. The
//! `initialize` request opens a session and the response carries its id in
//! the `mcp-session-id` header; every later request must send it back.
//! `GET /mcp` streams server-initiated messages and `DELETE /mcp` ends the
//! session.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::future::join_all;
use serde_json::Value;

use super::session::{
    close_session, open_direct_session, ClientSession, ConnectQuery, SessionMode, SessionScope,
};
use super::sse::message_stream;
use crate::error::{ApiError, ApiResult};
use crate::mcp::types::{error_reply, method_of, JsonRpcError, MessageKind};
use crate::state::AppState;
use crate::transport::headers::MCP_SESSION_ID;

/// `POST /mcp` for direct sessions
pub async fn post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let open_state = state.clone();
    let inbound = headers.clone();
    post_messages(&state, &headers, SessionScope::Direct, body, || async move {
        let request = query.into_request(&open_state, inbound).await?;
        open_direct_session(&open_state, SessionMode::StreamableHttp, request).await
    })
    .await
}

/// `GET /mcp`
pub async fn stream(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    open_stream(&state, &headers, SessionScope::Direct)
}

/// `DELETE /mcp`
pub async fn delete(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<StatusCode> {
    end_session(&state, &headers, SessionScope::Direct).await
}

pub(crate) fn open_stream(
    state: &AppState,
    headers: &HeaderMap,
    scope: SessionScope<'_>,
) -> ApiResult<Response> {
    let session = session_from_headers(state, headers, scope)?;
    Ok(message_stream(session, None, None)?.into_response())
}

pub(crate) async fn end_session(
    state: &AppState,
    headers: &HeaderMap,
    scope: SessionScope<'_>,
) -> ApiResult<StatusCode> {
    let session = session_from_headers(state, headers, scope)?;
    close_session(state, &session).await;
    tracing::info!(session_id = %session.id, "Client ended session");
    Ok(StatusCode::OK)
}

/// Relay one POST body (a message or a batch) through a session.
///
/// Without a session header the body must contain `initialize`, and `open`
/// creates the session. Requests wait for their replies; a body of only
/// notifications and responses is acknowledged with 202.
pub(crate) async fn post_messages<F, Fut>(
    state: &AppState,
    headers: &HeaderMap,
    scope: SessionScope<'_>,
    body: Value,
    open: F,
) -> ApiResult<Response>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ApiResult<Arc<ClientSession>>>,
{
    let (messages, batch) = match body {
        Value::Array(messages) => (messages, true),
        message => (vec![message], false),
    };
    if messages.is_empty() {
        return Err(ApiError::BadRequest("Empty batch".to_string()));
    }

    let session = if headers.contains_key(MCP_SESSION_ID) {
        session_from_headers(state, headers, scope)?
    } else {
        let initializes = messages
            .iter()
            .any(|m| MessageKind::of(m) == MessageKind::Request && method_of(m) == Some("initialize"));
        if !initializes {
            return Err(ApiError::BadRequest(format!(
                "Missing {} header; only initialize may start a session",
                MCP_SESSION_ID
            )));
        }
        open().await?
    };

    let mut waiting = Vec::new();
    for message in messages {
        let request = (MessageKind::of(&message) == MessageKind::Request).then(|| message.clone());
        let waiter = session.request(message).await.map_err(|e| {
            tracing::debug!(session_id = %session.id, error = %e, "Message for closed session");
            ApiError::SessionNotFound
        })?;
        if let (Some(request), Some(waiter)) = (request, waiter) {
            waiting.push((request, waiter));
        }
    }

    let session_header = HeaderValue::from_str(&session.id).map_err(|_| ApiError::Internal)?;
    if waiting.is_empty() {
        return Ok((StatusCode::ACCEPTED, [(MCP_SESSION_ID, session_header)]).into_response());
    }

    let request_timeout = state.config.request_timeout;
    let mut replies: Vec<Value> = join_all(waiting.into_iter().map(|(request, waiter)| {
        let session = session.clone();
        async move {
            match tokio::time::timeout(request_timeout, waiter).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => error_reply(
                    &request,
                    JsonRpcError::connection_closed("Backend closed before replying"),
                ),
                Err(_) => {
                    session.forget(&request);
                    tracing::warn!(
                        session_id = %session.id,
                        method = ?method_of(&request),
                        "Backend did not reply in time"
                    );
                    error_reply(
                        &request,
                        JsonRpcError::request_timeout(format!(
                            "No reply from backend within {:?}",
                            request_timeout
                        )),
                    )
                }
            }
        }
    }))
    .await;

    let body = if batch {
        Value::Array(replies)
    } else {
        replies.pop().unwrap_or(Value::Null)
    };
    Ok((StatusCode::OK, [(MCP_SESSION_ID, session_header)], Json(body)).into_response())
}

fn session_from_headers(
    state: &AppState,
    headers: &HeaderMap,
    scope: SessionScope<'_>,
) -> ApiResult<Arc<ClientSession>> {
    let id = headers
        .get(MCP_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("Missing {} header", MCP_SESSION_ID)))?;

    state
        .sessions
        .find(id, SessionMode::StreamableHttp, scope)
        .ok_or(ApiError::SessionNotFound)
}
