//! Legacy SSE client transport
//!
//! Opens a long-lived `GET` event stream, waits for the `endpoint` event and
//! then POSTs outgoing messages to that endpoint. Incoming messages arrive as
//! `message` events on the stream.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::factory::loggable_url;
use super::{Inbox, Transport, TransportKind};
use crate::mcp::error::{TransportError, TransportResult};
use crate::mcp::streaming::{SseDecoder, SseEvent};

/// Transport to a backend speaking the deprecated HTTP+SSE protocol
pub struct SseTransport {
    client: Client,
    url: Url,
    endpoint: Url,
    headers: HeaderMap,
    inbox: Inbox,
    closed: CancellationToken,
    connect_timeout: Duration,
}

impl SseTransport {
    /// Connect and wait for the endpoint announcement, bounded by `connect_timeout`
    pub async fn connect(
        client: Client,
        url: Url,
        headers: HeaderMap,
        connect_timeout: Duration,
    ) -> TransportResult<Self> {
        let closed = CancellationToken::new();
        let (in_tx, inbox) = Inbox::new(closed.clone());

        let handshake = async {
            let response = client
                .get(url.clone())
                .headers(headers.clone())
                .header(ACCEPT, "text/event-stream")
                .send()
                .await
                .map_err(|e| connect_error(&url, e, connect_timeout))?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                return Err(TransportError::Unauthorized(loggable_url(&url)));
            }
            if !status.is_success() {
                return Err(TransportError::ConnectionSetup(format!(
                    "{} returned HTTP {}",
                    loggable_url(&url),
                    status
                )));
            }

            let mut stream = Box::pin(response.bytes_stream());
            let mut decoder = SseDecoder::new();
            let mut early = Vec::new();

            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                let mut events = decoder.feed(&chunk).into_iter();
                while let Some(event) = events.next() {
                    if event.event_type() == "endpoint" {
                        let endpoint = url.join(event.data.trim()).map_err(|e| {
                            TransportError::ConnectionSetup(format!(
                                "invalid endpoint '{}': {}",
                                event.data, e
                            ))
                        })?;
                        early.extend(events);
                        return Ok::<_, TransportError>((endpoint, stream, decoder, early));
                    }
                    early.push(event);
                }
            }

            Err(TransportError::ConnectionSetup(format!(
                "{} closed the stream before sending an endpoint",
                loggable_url(&url)
            )))
        };

        let (endpoint, stream, decoder, early) =
            match tokio::time::timeout(connect_timeout, handshake).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(TransportError::Timeout {
                        operation: "waiting for SSE endpoint",
                        after: connect_timeout,
                    })
                }
            };

        tracing::info!(
            url = %loggable_url(&url),
            endpoint = %loggable_url(&endpoint),
            "Connected to SSE MCP server"
        );

        let reader_closed = closed.clone();
        let reader_url = loggable_url(&url);
        tokio::spawn(async move {
            let mut stream = stream;
            let mut decoder = decoder;

            for event in early {
                if !deliver(&in_tx, &reader_closed, event).await {
                    reader_closed.cancel();
                    return;
                }
            }

            loop {
                let next = tokio::select! {
                    next = stream.next() => next,
                    _ = reader_closed.cancelled() => break,
                };
                match next {
                    Some(Ok(chunk)) => {
                        for event in decoder.feed(&chunk) {
                            if !deliver(&in_tx, &reader_closed, event).await {
                                reader_closed.cancel();
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(url = %reader_url, error = %e, "SSE stream failed");
                        break;
                    }
                    None => {
                        if let Some(event) = decoder.finish() {
                            deliver(&in_tx, &reader_closed, event).await;
                        }
                        tracing::debug!(url = %reader_url, "SSE stream ended");
                        break;
                    }
                }
            }
            reader_closed.cancel();
        });

        Ok(Self {
            client,
            url,
            endpoint,
            headers,
            inbox,
            closed,
            connect_timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Push a `message` event into the inbox; false once nobody can receive
async fn deliver(
    in_tx: &tokio::sync::mpsc::Sender<Value>,
    closed: &CancellationToken,
    event: SseEvent,
) -> bool {
    if !event.is_message() {
        return true;
    }
    let message = match serde_json::from_str::<Value>(&event.data) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "Discarding non-JSON SSE message");
            return true;
        }
    };
    tokio::select! {
        result = in_tx.send(message) => result.is_ok(),
        _ = closed.cancelled() => false,
    }
}

/// Classify a failed request. A connect timeout also reports `is_connect`,
/// so the timeout check comes first.
pub(crate) fn connect_error(url: &Url, e: reqwest::Error, connect_timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout {
            operation: "connecting to backend",
            after: connect_timeout,
        }
    } else if e.is_connect() {
        TransportError::ConnectionSetup(format!(
            "could not connect to {}: {}",
            loggable_url(url),
            e.without_url()
        ))
    } else {
        TransportError::Http(e.without_url())
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&self, message: Value) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .json(&message)
            .send()
            .await
            .map_err(|e| connect_error(&self.endpoint, e, self.connect_timeout))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized(loggable_url(&self.endpoint)));
        }
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                url: loggable_url(&self.endpoint),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Value> {
        self.inbox.recv().await
    }

    async fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::debug!(url = %loggable_url(&self.url), "Closing SSE transport");
        }
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::HeaderMap as AxumHeaders;
    use axum::response::sse::{Event, Sse};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use futures::stream;
    use serde_json::json;
    use std::convert::Infallible;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Clone, Default)]
    struct Seen {
        posts: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    }

    async fn events() -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
        let items = vec![
            Ok(Event::default().event("endpoint").data("/messages?sessionId=s1")),
            Ok(Event::default().data(r#"{"jsonrpc":"2.0","method":"notifications/ready"}"#)),
        ];
        // Keep the stream open after the scripted events
        Sse::new(stream::iter(items).chain(stream::pending()))
    }

    async fn messages(
        State(seen): State<Seen>,
        headers: AxumHeaders,
        Json(body): Json<Value>,
    ) -> axum::http::StatusCode {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        seen.posts.lock().await.push((auth, body));
        axum::http::StatusCode::ACCEPTED
    }

    async fn serve(router: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Url::parse(&format!("http://{}/sse", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_endpoint_discovery_and_message_flow() {
        let seen = Seen::default();
        let router = Router::new()
            .route("/sse", get(events))
            .route("/messages", post(messages))
            .with_state(seen.clone());
        let url = serve(router).await;

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer client".parse().unwrap());
        let transport = SseTransport::connect(Client::new(), url, headers, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(transport.endpoint().path(), "/messages");
        assert_eq!(transport.endpoint().query(), Some("sessionId=s1"));

        let first = transport.recv().await.unwrap();
        assert_eq!(first["method"], "notifications/ready");

        transport
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await
            .unwrap();
        let posts = seen.posts.lock().await;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0.as_deref(), Some("Bearer client"));
        assert_eq!(posts[0].1["method"], "ping");
        drop(posts);

        transport.close().await;
        assert!(matches!(
            transport.send(json!({})).await,
            Err(TransportError::Closed)
        ));
    }

    /// Accepts connections and never answers
    async fn silent_listener() -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        Url::parse(&format!("http://{}/sse", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_unresponsive_backend_times_out() {
        let url = silent_listener().await;

        let err = SseTransport::connect(
            Client::new(),
            url,
            HeaderMap::new(),
            Duration::from_millis(200),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(
            err,
            TransportError::Timeout { after, .. } if after == Duration::from_millis(200)
        ));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_timed_out_request_maps_to_timeout() {
        let url = silent_listener().await;
        let client = Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .unwrap();

        let e = client.get(url.clone()).send().await.err().unwrap();
        assert!(e.is_timeout());
        let err = connect_error(&url, e, Duration::from_millis(100));
        assert!(matches!(err, TransportError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_refused_connection_is_setup_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = Url::parse(&format!("http://{}/sse?token=secret", addr)).unwrap();

        let err = SseTransport::connect(Client::new(), url, HeaderMap::new(), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::ConnectionSetup(_)));
        assert!(!err.to_string().contains("secret"));
    }

    #[tokio::test]
    async fn test_unauthorized_backend() {
        let router = Router::new().route(
            "/sse",
            get(|| async { axum::http::StatusCode::UNAUTHORIZED }),
        );
        let url = serve(router).await;

        let err = SseTransport::connect(Client::new(), url, HeaderMap::new(), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_missing_endpoint_times_out() {
        async fn silent() -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
            Sse::new(stream::pending())
        }
        let url = serve(Router::new().route("/sse", get(silent))).await;

        let err = SseTransport::connect(
            Client::new(),
            url,
            HeaderMap::new(),
            Duration::from_millis(200),
        )
        .await
        .err()
        .unwrap();
        assert!(err.is_transient());
    }
}
