//! Namespace Aggregator
//!
//! One virtual MCP server in front of every active member of a namespace.
//! List requests fan out to all members and merge; tool and prompt names
//! carry a `{server_name}__` prefix that routes calls back to their owner.
//!
//! Members are connected lazily on first use and reconnected after their
//! transport closes. A member that cannot be reached is left out of list
//! results and logged; it never fails the aggregate call.
//!
//! Notifications members send on their own (progress, list changes, log
//! messages) are published to subscribers of the aggregator.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::join_all;
use metamcp_shared::{NamespaceSnapshot, ServerParameters};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, Mutex};

use crate::logs::ServerLogStore;
use crate::mcp::router::{parse_name, prefix_items, prefix_name, ResourceOwners};
use crate::mcp::types::*;
use crate::mcp::{
    BackendNotification, McpClient, McpMethod, NotificationSink, TransportError, TransportResult,
};
use crate::transport::{TransportConnector, TransportRequest};

/// Member notifications buffered per subscriber
const NOTIFICATION_BUFFER: usize = 64;

struct Member {
    params: ServerParameters,
    client: Mutex<Option<Arc<McpClient>>>,
}

/// Virtual MCP server for one namespace
pub struct NamespaceAggregator {
    namespace: NamespaceSnapshot,
    members: Vec<Member>,
    connector: Arc<dyn TransportConnector>,
    logs: ServerLogStore,
    request_timeout: Duration,
    resource_owners: StdMutex<ResourceOwners>,
    notifications: NotificationSink,
}

impl NamespaceAggregator {
    pub fn new(
        namespace: NamespaceSnapshot,
        connector: Arc<dyn TransportConnector>,
        logs: ServerLogStore,
        request_timeout: Duration,
    ) -> Self {
        let members = namespace
            .active_servers()
            .map(|params| Member {
                params: params.clone(),
                client: Mutex::new(None),
            })
            .collect::<Vec<_>>();

        tracing::info!(
            namespace = %namespace.name,
            members = members.len(),
            "Namespace aggregator created"
        );

        Self {
            namespace,
            members,
            connector,
            logs,
            request_timeout,
            resource_owners: StdMutex::new(ResourceOwners::new()),
            notifications: broadcast::channel(NOTIFICATION_BUFFER).0,
        }
    }

    pub fn namespace(&self) -> &NamespaceSnapshot {
        &self.namespace
    }

    /// Notifications sent by members from now on
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<BackendNotification> {
        self.notifications.subscribe()
    }

    /// Handle one client message; `None` when no reply is due
    pub async fn handle(&self, message: Value) -> Option<Value> {
        match MessageKind::of(&message) {
            MessageKind::Request => Some(self.handle_request(&message).await),
            MessageKind::Notification => {
                tracing::trace!(method = ?method_of(&message), "Client notification");
                None
            }
            MessageKind::Response => None,
            MessageKind::Invalid => Some(error_reply(
                &message,
                JsonRpcError::invalid_request("Not a JSON-RPC 2.0 message"),
            )),
        }
    }

    async fn handle_request(&self, message: &Value) -> Value {
        let method_name = method_of(message).unwrap_or("");
        let method = McpMethod::from_name(method_name);
        let params = message.get("params").cloned();

        match method {
            McpMethod::Initialize => self.initialize_reply(message),
            McpMethod::Ping => {
                JsonRpcResponse::success(JsonRpcId::from_message(message), json!({})).into_value()
            }
            McpMethod::ToolsList
            | McpMethod::PromptsList
            | McpMethod::ResourcesList
            | McpMethod::ResourceTemplatesList => {
                let merged = self.fan_out(method, method_name, params).await;
                JsonRpcResponse::success(JsonRpcId::from_message(message), merged).into_value()
            }
            McpMethod::ToolsCall | McpMethod::PromptsGet => {
                self.route_named(message, method_name).await
            }
            McpMethod::ResourcesRead => self.route_resource(message).await,
            McpMethod::Notification | McpMethod::Unknown => {
                error_reply(message, JsonRpcError::method_not_found(method_name))
            }
        }
    }

    fn initialize_reply(&self, message: &Value) -> Value {
        let requested = message
            .pointer("/params/protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION);

        let result = InitializeResult {
            protocol_version: requested.to_string(),
            capabilities: json!({
                "tools": {},
                "prompts": {},
                "resources": {},
            }),
            server_info: Implementation {
                name: format!("metamcp-{}", self.namespace.name),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: None,
        };

        match serde_json::to_value(result) {
            Ok(result) => JsonRpcResponse::success(JsonRpcId::from_message(message), result).into_value(),
            Err(e) => error_reply(message, JsonRpcError::internal_error(e.to_string())),
        }
    }

    /// Ask every member and merge the listed items
    async fn fan_out(&self, method: McpMethod, method_name: &str, params: Option<Value>) -> Value {
        let Some(list_key) = method.list_key() else {
            return json!({});
        };

        let calls = self.members.iter().map(|member| {
            let params = params.clone();
            async move {
                let outcome = match self.client_for(member).await {
                    Ok(client) => client.request(method_name, params).await,
                    Err(e) => Err(e),
                };
                (member, outcome)
            }
        });

        let mut merged = Vec::new();
        let mut listed_resources = Vec::new();

        for (member, outcome) in join_all(calls).await {
            let name = member.params.name.as_str();
            let response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    self.report_unavailable(member, e).await;
                    continue;
                }
            };

            if let Some(error) = response.get("error") {
                let code = error.get("code").and_then(Value::as_i64);
                if code != Some(i64::from(JsonRpcError::METHOD_NOT_FOUND)) {
                    tracing::warn!(server = %name, method = %method_name, error = %error, "Member returned an error");
                }
                continue;
            }

            let items = response
                .pointer(&format!("/result/{}", list_key))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            if method == McpMethod::ResourcesList {
                listed_resources.push((name.to_string(), items.clone()));
            }
            if method.prefixes_names() {
                merged.extend(prefix_items(name, items));
            } else {
                merged.extend(items);
            }
        }

        if method == McpMethod::ResourcesList {
            if let Ok(mut owners) = self.resource_owners.lock() {
                owners.clear();
                for (name, items) in &listed_resources {
                    owners.record(name, items);
                }
            }
        }

        let mut result = Map::new();
        result.insert(list_key.to_string(), Value::Array(merged));
        Value::Object(result)
    }

    /// tools/call and prompts/get: strip the prefix and forward to the owner
    async fn route_named(&self, message: &Value, method_name: &str) -> Value {
        let params: NamedCallParams = match message
            .get("params")
            .cloned()
            .map(serde_json::from_value)
        {
            Some(Ok(params)) => params,
            _ => {
                return error_reply(
                    message,
                    JsonRpcError::invalid_params("params.name is required"),
                )
            }
        };

        let Some(parsed) = parse_name(&params.name) else {
            return error_reply(
                message,
                JsonRpcError::invalid_params(format!("'{}' is not a namespaced name", params.name)),
            );
        };
        let Some(member) = self.member(&parsed.server_name) else {
            return error_reply(
                message,
                JsonRpcError::invalid_params(format!("Unknown server '{}'", parsed.server_name)),
            );
        };

        let mut forwarded = message.get("params").cloned().unwrap_or_else(|| json!({}));
        forwarded["name"] = Value::String(parsed.name.clone());

        tracing::debug!(
            server = %parsed.server_name,
            method = %method_name,
            name = %parsed.name,
            "Routing call"
        );
        self.forward(member, message, method_name, forwarded).await
    }

    /// resources/read goes to whichever member listed the URI
    async fn route_resource(&self, message: &Value) -> Value {
        let params: ResourceReadParams = match message
            .get("params")
            .cloned()
            .map(serde_json::from_value)
        {
            Some(Ok(params)) => params,
            _ => return error_reply(message, JsonRpcError::invalid_params("params.uri is required")),
        };

        let mut owner = self.owner_of(&params.uri);
        if owner.is_none() {
            // Listing refreshes the owner map
            self.fan_out(McpMethod::ResourcesList, "resources/list", None)
                .await;
            owner = self.owner_of(&params.uri);
        }

        let Some(member) = owner.and_then(|name| self.member(&name)) else {
            return error_reply(
                message,
                JsonRpcError::invalid_params(format!("Unknown resource '{}'", params.uri)),
            );
        };

        let forwarded = message.get("params").cloned().unwrap_or_else(|| json!({}));
        self.forward(member, message, "resources/read", forwarded).await
    }

    /// Relay one request to `member` and return its reply verbatim under the
    /// client's id
    async fn forward(&self, member: &Member, message: &Value, method_name: &str, params: Value) -> Value {
        let outcome = match self.client_for(member).await {
            Ok(client) => client.request(method_name, Some(params)).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(mut response) => {
                response["id"] = message.get("id").cloned().unwrap_or(Value::Null);
                response
            }
            Err(e) => {
                let reason = e.to_string();
                self.report_unavailable(member, e).await;
                error_reply(
                    message,
                    JsonRpcError::internal_error(format!(
                        "Server '{}' unavailable: {}",
                        member.params.name, reason
                    )),
                )
            }
        }
    }

    /// Connected client for `member`, connecting and initializing on demand
    async fn client_for(&self, member: &Member) -> TransportResult<Arc<McpClient>> {
        let mut slot = member.client.lock().await;
        if let Some(client) = slot.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
        }

        let request = TransportRequest::from_server(&member.params);
        let transport = self.connector.connect(&request).await?;
        let client = Arc::new(McpClient::with_notifications(
            member.params.name.clone(),
            transport,
            self.request_timeout,
            Some(self.notifications.clone()),
        ));
        if let Err(e) = client.initialize().await {
            client.close().await;
            return Err(e);
        }

        *slot = Some(client.clone());
        Ok(client)
    }

    async fn report_unavailable(&self, member: &Member, error: TransportError) {
        let name = member.params.name.clone();
        let unavailable = TransportError::BackendUnavailable {
            server: name.clone(),
            reason: error.to_string(),
        };
        self.logs.error(&name, "Backend unavailable during aggregation", unavailable);

        // Drop a dead client so the next call reconnects
        let mut slot = member.client.lock().await;
        if slot.as_ref().is_some_and(|client| client.is_closed()) {
            *slot = None;
        }
    }

    fn member(&self, server_name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.params.name == server_name)
    }

    fn owner_of(&self, uri: &str) -> Option<String> {
        self.resource_owners
            .lock()
            .ok()
            .and_then(|owners| owners.owner_of(uri).map(str::to_string))
    }

    /// Close every member connection
    pub async fn shutdown(&self) {
        for member in &self.members {
            if let Some(client) = member.client.lock().await.take() {
                client.close().await;
            }
        }
        tracing::info!(namespace = %self.namespace.name, "Namespace aggregator shut down");
    }
}

/// Rewrite a member notification for the aggregate client; `None` drops it.
///
/// Cancellations refer to the member's own request ids and are dropped. Log
/// messages get the member's name on their logger.
pub fn client_notification(notification: BackendNotification) -> Option<Value> {
    let BackendNotification {
        server_name,
        mut message,
    } = notification;

    let method = method_of(&message).unwrap_or_default().to_string();
    match method.as_str() {
        "notifications/cancelled" => None,
        "notifications/message" => {
            let logger = message
                .pointer("/params/logger")
                .and_then(Value::as_str)
                .map(|logger| prefix_name(&server_name, logger))
                .unwrap_or_else(|| server_name.clone());
            if let Some(params) = message.get_mut("params").and_then(Value::as_object_mut) {
                params.insert("logger".to_string(), Value::String(logger));
            }
            Some(message)
        }
        _ => Some(message),
    }
}
