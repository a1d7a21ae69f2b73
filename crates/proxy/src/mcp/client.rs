//! MCP Client for backend connections
//!
//! Correlates JSON-RPC requests and responses over any [`Transport`]. One
//! reader task per client drains the transport and hands each response to
//! the caller waiting on its id. Backend notifications go to an optional
//! [`NotificationSink`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};

use super::error::{TransportError, TransportResult};
use super::types::*;
use crate::transport::Transport;

type Pending = Arc<Mutex<HashMap<JsonRpcId, oneshot::Sender<Value>>>>;

/// A notification a backend sent on its own
#[derive(Debug, Clone)]
pub struct BackendNotification {
    pub server_name: String,
    pub message: Value,
}

pub type NotificationSink = broadcast::Sender<BackendNotification>;

/// MCP client bound to one backend transport
pub struct McpClient {
    server_name: String,
    transport: Arc<dyn Transport>,
    pending: Pending,
    next_id: AtomicI64,
    request_timeout: Duration,
}

impl McpClient {
    /// Wrap a started transport and begin reading from it
    pub fn new(
        server_name: impl Into<String>,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
    ) -> Self {
        Self::with_notifications(server_name, transport, request_timeout, None)
    }

    /// Like [`new`](Self::new), publishing backend notifications to `sink`
    pub fn with_notifications(
        server_name: impl Into<String>,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
        sink: Option<NotificationSink>,
    ) -> Self {
        let server_name = server_name.into();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(read_loop(
            server_name.clone(),
            transport.clone(),
            pending.clone(),
            sink,
        ));

        Self {
            server_name,
            transport,
            pending,
            next_id: AtomicI64::new(1),
            request_timeout,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Send a request and wait for the raw response message.
    ///
    /// JSON-RPC error responses are returned as-is; only transport failures
    /// and timeouts are errors.
    pub async fn request(&self, method: &str, params: Option<Value>) -> TransportResult<Value> {
        let id = JsonRpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id.clone(), tx);
        }

        let request = JsonRpcRequest::new(id.clone(), method, params);
        if let Err(e) = self.transport.send(serde_json::to_value(&request)?).await {
            self.forget(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.forget(&id);
                tracing::warn!(server = %self.server_name, method = %method, "Request timed out");
                Err(TransportError::Timeout {
                    operation: "awaiting backend response",
                    after: self.request_timeout,
                })
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> TransportResult<()> {
        let notification = JsonRpcRequest::notification(method, params);
        self.transport.send(serde_json::to_value(&notification)?).await
    }

    /// Run the initialize handshake
    pub async fn initialize(&self) -> TransportResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: Implementation::this_proxy(),
        };
        let response = self
            .request("initialize", Some(serde_json::to_value(&params)?))
            .await?;

        if let Some(error) = response.get("error") {
            return Err(TransportError::ConnectionSetup(format!(
                "{} rejected initialize: {}",
                self.server_name, error
            )));
        }
        let result: InitializeResult = serde_json::from_value(
            response.get("result").cloned().unwrap_or(Value::Null),
        )?;

        self.notify("notifications/initialized", None).await?;

        tracing::debug!(
            server = %self.server_name,
            protocol_version = %result.protocol_version,
            backend = %result.server_info.name,
            "Backend initialized"
        );
        Ok(result)
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }

    fn forget(&self, id: &JsonRpcId) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(id);
        }
    }
}

async fn read_loop(
    server_name: String,
    transport: Arc<dyn Transport>,
    pending: Pending,
    sink: Option<NotificationSink>,
) {
    while let Some(message) = transport.recv().await {
        match MessageKind::of(&message) {
            MessageKind::Response => {
                let waiter = JsonRpcId::from_message(&message)
                    .and_then(|id| pending.lock().ok().and_then(|mut p| p.remove(&id)));
                match waiter {
                    Some(tx) => {
                        if tx.send(message).is_err() {
                            tracing::debug!(server = %server_name, "Caller gave up before the response");
                        }
                    }
                    None => {
                        tracing::debug!(server = %server_name, "Dropping response with no waiter");
                    }
                }
            }
            MessageKind::Request => {
                // Backends may ping; anything else is not offered by the proxy
                let reply = if method_of(&message) == Some("ping") {
                    JsonRpcResponse::success(JsonRpcId::from_message(&message), json!({}))
                        .into_value()
                } else {
                    error_reply(
                        &message,
                        JsonRpcError::method_not_found(method_of(&message).unwrap_or("")),
                    )
                };
                if let Err(e) = transport.send(reply).await {
                    tracing::debug!(server = %server_name, error = %e, "Failed to answer backend request");
                }
            }
            MessageKind::Notification => {
                tracing::trace!(
                    server = %server_name,
                    method = ?method_of(&message),
                    "Backend notification"
                );
                if let Some(sink) = &sink {
                    let notification = BackendNotification {
                        server_name: server_name.clone(),
                        message,
                    };
                    if sink.send(notification).is_err() {
                        tracing::trace!(server = %server_name, "No notification listeners");
                    }
                }
            }
            MessageKind::Invalid => {
                tracing::warn!(server = %server_name, "Ignoring malformed message from backend");
            }
        }
    }

    // Dropping the senders wakes every waiter with a closed error
    if let Ok(mut pending) = pending.lock() {
        pending.clear();
    }
    tracing::debug!(server = %server_name, "Backend reader exiting");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;

    /// Minimal backend answering initialize and echoing tool calls
    fn spawn_backend(server: Arc<ChannelTransport>) {
        tokio::spawn(async move {
            while let Some(message) = server.recv().await {
                let Some(method) = method_of(&message).map(str::to_string) else {
                    continue;
                };
                let id = JsonRpcId::from_message(&message);
                if id.is_none() {
                    continue;
                }
                let reply = match method.as_str() {
                    "initialize" => JsonRpcResponse::success(
                        id,
                        json!({
                            "protocolVersion": PROTOCOL_VERSION,
                            "capabilities": {"tools": {}},
                            "serverInfo": {"name": "fake", "version": "0.0.1"}
                        }),
                    ),
                    "slow" => continue,
                    _ => JsonRpcResponse::success(id, json!({"echo": message["params"].clone()})),
                };
                server.send(reply.into_value()).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_initialize_and_request() {
        let (client_side, server_side) = ChannelTransport::pair();
        spawn_backend(server_side);

        let client = McpClient::new("fake", client_side, Duration::from_secs(5));
        let init = client.initialize().await.unwrap();
        assert_eq!(init.server_info.name, "fake");

        let response = client
            .request("tools/call", Some(json!({"name": "search"})))
            .await
            .unwrap();
        assert_eq!(response["result"]["echo"]["name"], "search");
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let (client_side, server_side) = ChannelTransport::pair();
        spawn_backend(server_side);
        let client = Arc::new(McpClient::new("fake", client_side, Duration::from_secs(5)));

        let calls = (0..10).map(|i| {
            let client = client.clone();
            async move {
                client
                    .request("echo", Some(json!({"n": i})))
                    .await
                    .unwrap()
            }
        });
        let responses = futures::future::join_all(calls).await;

        for (i, response) in responses.iter().enumerate() {
            assert_eq!(response["result"]["echo"]["n"], i);
        }
    }

    #[tokio::test]
    async fn test_notifications_reach_sink() {
        let (client_side, server_side) = ChannelTransport::pair();
        let (sink, mut notifications) = broadcast::channel(8);
        let _client = McpClient::with_notifications(
            "fake",
            client_side,
            Duration::from_secs(5),
            Some(sink),
        );

        server_side
            .send(json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}))
            .await
            .unwrap();

        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.server_name, "fake");
        assert_eq!(notification.message["method"], "notifications/tools/list_changed");
    }

    #[tokio::test]
    async fn test_timeout_and_close() {
        let (client_side, server_side) = ChannelTransport::pair();
        spawn_backend(server_side.clone());
        let client = McpClient::new("fake", client_side, Duration::from_millis(100));

        let err = client.request("slow", None).await.err().unwrap();
        assert!(err.is_transient());

        server_side.close().await;
        assert!(client.is_closed());
        let err = client.request("echo", None).await.err().unwrap();
        assert!(matches!(err, TransportError::Closed));
    }
}
