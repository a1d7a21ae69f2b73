//! Legacy SSE front end
//!
//! `GET /sse` opens a session and streams server messages; the first event
//! (`endpoint`) tells the client where to POST its own messages.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use super::session::{
    open_direct_session, ClientSession, ConnectQuery, SessionGuard, SessionMode, SessionScope,
};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQuery {
    pub session_id: String,
}

/// Open a direct session and stream it
pub async fn connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>> {
    let request = query.into_request(&state, headers).await?;
    let session = open_direct_session(&state, SessionMode::Sse, request).await?;

    let endpoint = format!("/message?sessionId={}", session.id);
    let guard = SessionGuard::new(state, session.clone());
    message_stream(session, Some(endpoint), Some(guard))
}

/// `POST /message` for direct sessions
pub async fn post_message(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    Json(message): Json<Value>,
) -> ApiResult<StatusCode> {
    forward_message(&state, &query.session_id, SessionScope::Direct, message).await
}

/// Forward a client message to an SSE session
pub(crate) async fn forward_message(
    state: &AppState,
    session_id: &str,
    scope: SessionScope<'_>,
    message: Value,
) -> ApiResult<StatusCode> {
    let session = state
        .sessions
        .find(session_id, SessionMode::Sse, scope)
        .ok_or(ApiError::SessionNotFound)?;

    session.send(message).await.map_err(|e| {
        tracing::debug!(session_id = %session.id, error = %e, "Message for closed session");
        ApiError::SessionNotFound
    })?;

    Ok(StatusCode::ACCEPTED)
}

/// Holds a session's outbound stream while a client is reading it
struct StreamLease {
    session: Arc<ClientSession>,
    receiver: Option<mpsc::Receiver<Value>>,
    _guard: Option<SessionGuard>,
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            self.session.restore_stream(receiver);
        }
    }
}

/// Stream a session's server messages as `message` events.
///
/// `endpoint` becomes the first event when set. `guard` lives as long as
/// the stream, so a guarded session is closed when the client goes away.
pub(crate) fn message_stream(
    session: Arc<ClientSession>,
    endpoint: Option<String>,
    guard: Option<SessionGuard>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>> {
    let receiver = session
        .take_stream()
        .ok_or_else(|| ApiError::Conflict("A stream is already open for this session".to_string()))?;

    let lease = StreamLease {
        session,
        receiver: Some(receiver),
        _guard: guard,
    };
    let messages = futures::stream::unfold(lease, |mut lease| async move {
        let message = lease.receiver.as_mut()?.recv().await?;
        Some((message, lease))
    })
    .map(|message| Ok(Event::default().event("message").data(message.to_string())));

    let first = tokio_stream::iter(
        endpoint.map(|uri| Ok(Event::default().event("endpoint").data(uri))),
    );

    Ok(Sse::new(first.chain(messages)).keep_alive(
        KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("ping"),
    ))
}
