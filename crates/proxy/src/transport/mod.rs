//! Message transports
//!
//! A transport is a bidirectional channel of JSON-RPC messages to one peer:
//! a spawned MCP server process, a remote SSE or streamable-HTTP endpoint, or
//! an in-process channel standing in for a client.
//!
//! ```text
//! Client --(ChannelTransport)--> pool relay --(Stdio/Sse/StreamableHttp)--> Backend
//! ```

pub mod env;
pub mod executable;
pub mod factory;
pub mod headers;
pub mod shell;
pub mod sse;
pub mod stdio;
pub mod streamable_http;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::mcp::error::{TransportError, TransportResult};

pub use factory::{
    ArgList, FactorySettings, NamespaceConnector, TransportConnector, TransportFactory,
    TransportRequest,
};
pub use headers::{SseHeaders, StreamableHttpHeaders};

/// Buffered inbound messages per transport
pub(crate) const INBOUND_BUFFER: usize = 256;

/// Kind of peer a transport talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
    Channel,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::StreamableHttp => "streamable-http",
            TransportKind::Channel => "channel",
        };
        f.write_str(name)
    }
}

/// Bidirectional JSON-RPC message channel
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one message to the peer
    async fn send(&self, message: Value) -> TransportResult<()>;

    /// Next message from the peer; `None` once the transport is closed
    async fn recv(&self) -> Option<Value>;

    /// Release the underlying resources. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    fn kind(&self) -> TransportKind;
}

/// Inbound half shared by every transport implementation
pub(crate) struct Inbox {
    rx: Mutex<mpsc::Receiver<Value>>,
    closed: CancellationToken,
}

impl Inbox {
    pub(crate) fn new(closed: CancellationToken) -> (mpsc::Sender<Value>, Self) {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        (
            tx,
            Self {
                rx: Mutex::new(rx),
                closed,
            },
        )
    }

    /// Buffered messages drain before the close is observed
    pub(crate) async fn recv(&self) -> Option<Value> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            message = rx.recv() => message,
            _ = self.closed.cancelled() => rx.try_recv().ok(),
        }
    }
}

/// One end of an in-memory transport pair
///
/// Closing either end closes both.
pub struct ChannelTransport {
    outbound: mpsc::Sender<Value>,
    inbox: Inbox,
    closed: CancellationToken,
}

impl ChannelTransport {
    /// Create two connected ends
    pub fn pair() -> (Arc<ChannelTransport>, Arc<ChannelTransport>) {
        let closed = CancellationToken::new();
        let (to_b, inbox_b) = Inbox::new(closed.clone());
        let (to_a, inbox_a) = Inbox::new(closed.clone());

        let a = ChannelTransport {
            outbound: to_b,
            inbox: inbox_a,
            closed: closed.clone(),
        };
        let b = ChannelTransport {
            outbound: to_a,
            inbox: inbox_b,
            closed,
        };
        (Arc::new(a), Arc::new(b))
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: Value) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            result = self.outbound.send(message) => result.map_err(|_| TransportError::Closed),
            _ = self.closed.cancelled() => Err(TransportError::Closed),
        }
    }

    async fn recv(&self) -> Option<Value> {
        self.inbox.recv().await
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_pair_delivers_in_order() {
        let (a, b) = ChannelTransport::pair();

        a.send(json!({"n": 1})).await.unwrap();
        a.send(json!({"n": 2})).await.unwrap();
        b.send(json!({"n": 3})).await.unwrap();

        assert_eq!(b.recv().await.unwrap()["n"], 1);
        assert_eq!(b.recv().await.unwrap()["n"], 2);
        assert_eq!(a.recv().await.unwrap()["n"], 3);
    }

    #[tokio::test]
    async fn test_closing_one_end_closes_both() {
        let (a, b) = ChannelTransport::pair();
        a.send(json!({"pending": true})).await.unwrap();

        b.close().await;

        assert!(a.is_closed());
        assert!(matches!(a.send(json!({})).await, Err(TransportError::Closed)));
        // Already buffered messages are still delivered
        assert_eq!(b.recv().await.unwrap()["pending"], true);
        assert!(b.recv().await.is_none());
        assert!(a.recv().await.is_none());
    }
}
