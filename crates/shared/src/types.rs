//! Common types used across MetaMCP

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Backend MCP server ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub Uuid);

impl ServerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ServerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Namespace ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(pub Uuid);

impl NamespaceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NamespaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for NamespaceId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Server Parameters
// =============================================================================

/// How a backend MCP server is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum McpServerType {
    Stdio,
    Sse,
    StreamableHttp,
}

impl McpServerType {
    /// Transport selector understood by the transport factory
    pub fn selector(&self) -> &'static str {
        match self {
            McpServerType::Stdio => "stdio",
            McpServerType::Sse => "sse",
            McpServerType::StreamableHttp => "streamable-http",
        }
    }
}

/// What happens to a spawned server's stderr
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Captured and streamed into the server log
    #[default]
    Pipe,
    /// Shares the proxy's own stderr
    Inherit,
    /// Discarded
    Ignore,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    #[default]
    Active,
    Inactive,
}

/// Immutable snapshot of one backend MCP server's configuration
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerParameters {
    pub uuid: ServerId,
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: McpServerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    #[serde(default, rename = "stderr")]
    pub stderr_mode: StderrMode,
    #[serde(default)]
    pub status: ServerStatus,
}

impl ServerParameters {
    /// Stable hash of every field that influences how the backend is launched.
    ///
    /// Two snapshots with the same fingerprint produce interchangeable transports,
    /// which is what the idle session cache keys on.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    pub fn is_active(&self) -> bool {
        self.status == ServerStatus::Active
    }
}

// Bearer tokens and env values must never reach the logs
impl fmt::Debug for ServerParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerParameters")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("server_type", &self.server_type)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("url", &self.url)
            .field(
                "bearer_token",
                &self.bearer_token.as_ref().map(|_| "[redacted]"),
            )
            .field("stderr_mode", &self.stderr_mode)
            .field("status", &self.status)
            .finish()
    }
}

// =============================================================================
// Namespaces
// =============================================================================

/// A named grouping of backend servers presented as one virtual server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    pub uuid: NamespaceId,
    pub name: String,
    #[serde(default)]
    pub server_uuids: Vec<ServerId>,
}

/// Binds an API key to the namespace it exposes
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyBinding {
    pub key: String,
    pub namespace_uuid: NamespaceId,
}

impl fmt::Debug for ApiKeyBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyBinding")
            .field("key", &"[redacted]")
            .field("namespace_uuid", &self.namespace_uuid)
            .finish()
    }
}

/// Resolved namespace with the full parameters of every member server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSnapshot {
    pub uuid: NamespaceId,
    pub name: String,
    #[serde(default)]
    pub servers: Vec<ServerParameters>,
}

impl NamespaceSnapshot {
    /// Members that take part in aggregation
    pub fn active_servers(&self) -> impl Iterator<Item = &ServerParameters> {
        self.servers.iter().filter(|s| s.is_active())
    }
}

// =============================================================================
// Log Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Structured log entry consumed by the external log store / UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerLogEvent {
    pub server_name: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ServerLogEvent {
    pub fn new(server_name: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            level,
            message: message.into(),
            error: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

// =============================================================================
// Health
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn stdio_server() -> ServerParameters {
        ServerParameters {
            uuid: ServerId::new(),
            name: "filesystem".to_string(),
            server_type: McpServerType::Stdio,
            command: Some("npx".to_string()),
            args: vec!["-y".to_string(), "@modelcontextprotocol/server-filesystem".to_string()],
            env: BTreeMap::from([("TOKEN".to_string(), "secret".to_string())]),
            url: None,
            bearer_token: None,
            stderr_mode: StderrMode::Pipe,
            status: ServerStatus::Active,
        }
    }

    #[test]
    fn test_server_parameters_wire_format() {
        let json = r#"{
            "uuid": "6f2b2f52-9c1a-4c69-9d0b-0f6f7f1c8f11",
            "name": "remote",
            "type": "STREAMABLE_HTTP",
            "url": "http://localhost:9000/mcp",
            "bearerToken": "abc"
        }"#;

        let params: ServerParameters = serde_json::from_str(json).unwrap();
        assert_eq!(params.server_type, McpServerType::StreamableHttp);
        assert_eq!(params.bearer_token.as_deref(), Some("abc"));
        assert_eq!(params.stderr_mode, StderrMode::Pipe);
        assert!(params.is_active());
    }

    #[test]
    fn test_fingerprint_tracks_launch_fields() {
        let params = stdio_server();
        let same = params.clone();
        assert_eq!(params.fingerprint(), same.fingerprint());

        let mut changed = params.clone();
        changed.env.insert("TOKEN".to_string(), "rotated".to_string());
        assert_ne!(params.fingerprint(), changed.fingerprint());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut params = stdio_server();
        params.bearer_token = Some("super-secret-token".to_string());

        let rendered = format!("{:?}", params);
        assert!(!rendered.contains("super-secret-token"));
        assert!(!rendered.contains("secret\""));
        assert!(rendered.contains("[redacted]"));
    }

    #[test]
    fn test_active_servers_skips_inactive() {
        let mut inactive = stdio_server();
        inactive.status = ServerStatus::Inactive;
        let snapshot = NamespaceSnapshot {
            uuid: NamespaceId::new(),
            name: "dev".to_string(),
            servers: vec![stdio_server(), inactive],
        };

        assert_eq!(snapshot.active_servers().count(), 1);
    }

    #[test]
    fn test_log_event_serialization() {
        let event = ServerLogEvent::new("github", LogLevel::Warn, "slow start").with_error("timeout");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["serverName"], "github");
        assert_eq!(value["level"], "warn");
        assert_eq!(value["error"], "timeout");
    }
}
