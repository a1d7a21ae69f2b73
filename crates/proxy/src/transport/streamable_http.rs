//! Streamable-HTTP client transport
//!
//! Every outgoing message is a `POST` to the endpoint. The backend answers
//! with a JSON body, an SSE stream of messages, or `202 Accepted`. The
//! `mcp-session-id` it hands out is echoed on every later request.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::factory::loggable_url;
use super::headers::MCP_SESSION_ID;
use super::sse::connect_error;
use super::{Inbox, Transport, TransportKind};
use crate::mcp::error::{TransportError, TransportResult};
use crate::mcp::streaming::SseDecoder;

const SESSION_DELETE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport to a backend speaking streamable HTTP
pub struct StreamableHttpTransport {
    client: Client,
    url: Url,
    headers: HeaderMap,
    session_id: StdMutex<Option<HeaderValue>>,
    in_tx: mpsc::Sender<Value>,
    inbox: Inbox,
    closed: CancellationToken,
    /// Serializes POSTs so messages reach the backend in order
    send_lock: Mutex<()>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl StreamableHttpTransport {
    /// Check that the endpoint answers, then build the transport.
    ///
    /// The check is a `GET` for the server stream, bounded by
    /// `connect_timeout`. Any status but 401 counts as reachable: servers
    /// without a standalone stream answer 405.
    pub async fn connect(
        client: Client,
        url: Url,
        headers: HeaderMap,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> TransportResult<Self> {
        let check = client
            .get(url.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send();

        let response = match tokio::time::timeout(connect_timeout, check).await {
            Ok(result) => result.map_err(|e| connect_error(&url, e, connect_timeout))?,
            Err(_) => {
                return Err(TransportError::Timeout {
                    operation: "reaching streamable-HTTP endpoint",
                    after: connect_timeout,
                })
            }
        };
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized(loggable_url(&url)));
        }
        tracing::debug!(
            url = %loggable_url(&url),
            status = response.status().as_u16(),
            "Streamable-HTTP endpoint reachable"
        );
        drop(response);

        Ok(Self::new(client, url, headers, connect_timeout, request_timeout))
    }

    /// Build the transport without contacting the endpoint.
    ///
    /// A passthrough `mcp-session-id` in `headers` becomes the initial session.
    pub fn new(
        client: Client,
        url: Url,
        mut headers: HeaderMap,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        let session_id = headers.remove(MCP_SESSION_ID);
        let closed = CancellationToken::new();
        let (in_tx, inbox) = Inbox::new(closed.clone());

        tracing::info!(url = %loggable_url(&url), "Created streamable-HTTP transport");

        Self {
            client,
            url,
            headers,
            session_id: StdMutex::new(session_id),
            in_tx,
            inbox,
            closed,
            send_lock: Mutex::new(()),
            connect_timeout,
            request_timeout,
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.current_session()
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }

    fn current_session(&self) -> Option<HeaderValue> {
        self.session_id.lock().ok().and_then(|guard| guard.clone())
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/event-stream"));
        if let Some(session) = self.current_session() {
            headers.insert(HeaderName::from_static(MCP_SESSION_ID), session);
        }
        headers
    }

    async fn handle_response(&self, response: Response) -> TransportResult<()> {
        if let Some(session) = response.headers().get(MCP_SESSION_ID) {
            if let Ok(mut guard) = self.session_id.lock() {
                *guard = Some(session.clone());
            }
        }

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized(loggable_url(&self.url)));
        }
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                url: loggable_url(&self.url),
                status: status.as_u16(),
            });
        }
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            self.pump_event_stream(response);
            return Ok(());
        }

        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        match serde_json::from_slice::<Value>(&body)? {
            Value::Array(batch) => {
                for message in batch {
                    self.push(message).await;
                }
            }
            message => self.push(message).await,
        }
        Ok(())
    }

    /// Relay a streamed response in the background so later sends are not
    /// held up by a long-running call
    fn pump_event_stream(&self, response: Response) {
        let in_tx = self.in_tx.clone();
        let closed = self.closed.clone();
        let url = loggable_url(&self.url);

        tokio::spawn(async move {
            let mut stream = Box::pin(response.bytes_stream());
            let mut decoder = SseDecoder::new();
            loop {
                let next = tokio::select! {
                    next = stream.next() => next,
                    _ = closed.cancelled() => return,
                };
                let ended = next.is_none();
                let events = match next {
                    Some(Ok(chunk)) => decoder.feed(&chunk),
                    Some(Err(e)) => {
                        tracing::warn!(url = %url, error = %e, "Response stream failed");
                        return;
                    }
                    None => decoder.finish().into_iter().collect(),
                };

                for event in events.into_iter().filter(|e| e.is_message()) {
                    match serde_json::from_str::<Value>(&event.data) {
                        Ok(message) => {
                            if in_tx.send(message).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(url = %url, error = %e, "Discarding non-JSON SSE message")
                        }
                    }
                }
                if ended {
                    return;
                }
            }
        });
    }

    async fn push(&self, message: Value) {
        tokio::select! {
            _ = self.in_tx.send(message) => {}
            _ = self.closed.cancelled() => {}
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn send(&self, message: Value) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let _guard = self.send_lock.lock().await;
        let request = self
            .client
            .post(self.url.clone())
            .headers(self.request_headers())
            .json(&message)
            .send();

        let response = match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result.map_err(|e| connect_error(&self.url, e, self.connect_timeout))?,
            Err(_) => {
                return Err(TransportError::Timeout {
                    operation: "posting to streamable-HTTP endpoint",
                    after: self.request_timeout,
                })
            }
        };
        self.handle_response(response).await
    }

    async fn recv(&self) -> Option<Value> {
        self.inbox.recv().await
    }

    /// Ends the backend session with a best-effort `DELETE`
    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        let Some(session) = self.current_session() else {
            return;
        };
        let request = self
            .client
            .delete(self.url.clone())
            .headers(self.headers.clone())
            .header(MCP_SESSION_ID, session)
            .timeout(SESSION_DELETE_TIMEOUT)
            .send();
        if let Err(e) = request.await {
            tracing::debug!(url = %loggable_url(&self.url), error = %e.without_url(), "Session DELETE failed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }
}
