//! In-process fake MCP servers for pool, aggregator and route tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::mcp::types::*;
use crate::mcp::{TransportError, TransportResult};
use crate::transport::{ChannelTransport, Transport, TransportConnector, TransportRequest};

/// Spawn a fake MCP server named `name` exposing `tools`.
///
/// Returns the client end. `prompts/list` is answered with method-not-found
/// so aggregation of partially capable servers can be exercised.
pub fn fake_mcp_server(name: &str, tools: &[&str]) -> Arc<ChannelTransport> {
    fake_mcp_server_ignoring(name, tools, HashSet::new())
}

/// Like [`fake_mcp_server`], but requests for `unanswered` methods never get
/// a reply. A `tools/call` carrying `_meta.progressToken` reports progress
/// before replying.
pub fn fake_mcp_server_ignoring(
    name: &str,
    tools: &[&str],
    unanswered: HashSet<String>,
) -> Arc<ChannelTransport> {
    let (client_end, server_end) = ChannelTransport::pair();
    let name = name.to_string();
    let tools: Vec<String> = tools.iter().map(|t| t.to_string()).collect();

    tokio::spawn(async move {
        while let Some(message) = server_end.recv().await {
            if MessageKind::of(&message) != MessageKind::Request {
                continue;
            }
            let id = JsonRpcId::from_message(&message);
            let method = method_of(&message).unwrap_or("").to_string();
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            if unanswered.contains(&method) {
                continue;
            }

            if let Some(token) = params.pointer("/_meta/progressToken") {
                let progress = json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/progress",
                    "params": {"progressToken": token, "progress": 1, "total": 1}
                });
                if server_end.send(progress).await.is_err() {
                    break;
                }
            }

            let reply = match method.as_str() {
                "initialize" => JsonRpcResponse::success(
                    id,
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {"tools": {}, "resources": {}},
                        "serverInfo": {"name": name, "version": "0.0.1"}
                    }),
                ),
                "ping" => JsonRpcResponse::success(id, json!({})),
                "tools/list" => {
                    let listed: Vec<Value> = tools
                        .iter()
                        .map(|tool| json!({"name": tool, "inputSchema": {"type": "object"}}))
                        .collect();
                    JsonRpcResponse::success(id, json!({ "tools": listed }))
                }
                "tools/call" => {
                    let tool = params["name"].as_str().unwrap_or("");
                    if tools.iter().any(|t| t == tool) {
                        JsonRpcResponse::success(
                            id,
                            json!({
                                "content": [{"type": "text", "text": format!("{}:{}", name, tool)}],
                                "arguments": params.get("arguments").cloned().unwrap_or(Value::Null)
                            }),
                        )
                    } else {
                        JsonRpcResponse::error(
                            id,
                            JsonRpcError::invalid_params(format!("no tool {}", tool)),
                        )
                    }
                }
                "resources/list" => JsonRpcResponse::success(
                    id,
                    json!({"resources": [{"uri": format!("{}://doc", name), "name": "doc"}]}),
                ),
                "resources/read" => JsonRpcResponse::success(
                    id,
                    json!({"contents": [{"uri": params["uri"], "text": format!("read by {}", name)}]}),
                ),
                other => JsonRpcResponse::error(id, JsonRpcError::method_not_found(other)),
            };

            if server_end.send(reply.into_value()).await.is_err() {
                break;
            }
        }
    });

    client_end
}

/// Connector handing out fake servers and counting how often it was asked
#[derive(Default)]
pub struct FakeConnector {
    pub connects: AtomicUsize,
    pub failing: HashSet<String>,
    pub tools: Vec<String>,
    pub delay: Option<Duration>,
    /// Methods the fake servers never answer
    pub unanswered: HashSet<String>,
    /// Connects left that time out before the first success
    pub timeouts_left: AtomicUsize,
}

impl FakeConnector {
    pub fn with_tools(tools: &[&str]) -> Self {
        Self {
            tools: tools.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn failing(mut self, server_name: &str) -> Self {
        self.failing.insert(server_name.to_string());
        self
    }

    pub fn unanswered(mut self, method: &str) -> Self {
        self.unanswered.insert(method.to_string());
        self
    }

    pub fn timing_out(self, attempts: usize) -> Self {
        self.timeouts_left.store(attempts, Ordering::SeqCst);
        self
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn connect(&self, request: &TransportRequest) -> TransportResult<Arc<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let timed_out = self
            .timeouts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if timed_out {
            return Err(TransportError::Timeout {
                operation: "connecting to fake server",
                after: Duration::from_millis(10),
            });
        }
        if self.failing.contains(&request.server_name) {
            return Err(TransportError::ConnectionSetup(format!(
                "{} refused connection",
                request.server_name
            )));
        }
        let tools: Vec<&str> = self.tools.iter().map(String::as_str).collect();
        Ok(fake_mcp_server_ignoring(
            &request.server_name,
            &tools,
            self.unanswered.clone(),
        ))
    }
}
