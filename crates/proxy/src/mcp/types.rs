//! MCP Protocol Types
//!
//! JSON-RPC 2.0 envelopes plus the handful of MCP payloads the proxy itself
//! has to understand. Everything the proxy merely relays stays a raw
//! [`serde_json::Value`] so that backend payloads reach the client untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision the proxy speaks when it initializes backends itself
pub const PROTOCOL_VERSION: &str = "2025-03-26";

// =============================================================================
// JSON-RPC 2.0 Types
// =============================================================================

/// JSON-RPC request ID - can be string, number, or null
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum JsonRpcId {
    String(String),
    Number(i64),
    Null,
}

impl JsonRpcId {
    /// Read the id of a raw message, if it carries a usable one
    pub fn from_message(message: &Value) -> Option<Self> {
        match message.get("id")? {
            Value::String(s) => Some(JsonRpcId::String(s.clone())),
            Value::Number(n) => n.as_i64().map(JsonRpcId::Number),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            JsonRpcId::String(s) => Value::String(s.clone()),
            JsonRpcId::Number(n) => Value::from(*n),
            JsonRpcId::Null => Value::Null,
        }
    }
}

/// Outgoing JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: JsonRpcId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a successful response
    pub fn success(id: Option<JsonRpcId>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Option<JsonRpcId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    // Standard JSON-RPC error codes
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    // Implementation-defined server errors
    pub const CONNECTION_CLOSED: i32 = -32000;
    pub const REQUEST_TIMEOUT: i32 = -32001;

    pub fn parse_error(msg: impl Into<String>) -> Self {
        Self::with_code(Self::PARSE_ERROR, msg)
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::with_code(Self::INVALID_REQUEST, msg)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::with_code(Self::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::with_code(Self::INVALID_PARAMS, msg)
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::with_code(Self::INTERNAL_ERROR, msg)
    }

    pub fn connection_closed(msg: impl Into<String>) -> Self {
        Self::with_code(Self::CONNECTION_CLOSED, msg)
    }

    pub fn request_timeout(msg: impl Into<String>) -> Self {
        Self::with_code(Self::REQUEST_TIMEOUT, msg)
    }

    fn with_code(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
            data: None,
        }
    }
}

// =============================================================================
// Raw message classification
// =============================================================================

/// Shape of a raw JSON-RPC message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
    Invalid,
}

impl MessageKind {
    pub fn of(message: &Value) -> Self {
        let has_method = message.get("method").is_some_and(Value::is_string);
        let has_id = message.get("id").is_some_and(|id| !id.is_null());
        let has_outcome = message.get("result").is_some() || message.get("error").is_some();

        match (has_method, has_id, has_outcome) {
            (true, true, _) => MessageKind::Request,
            (true, false, _) => MessageKind::Notification,
            (false, true, true) => MessageKind::Response,
            _ => MessageKind::Invalid,
        }
    }
}

/// Method name of a request or notification
pub fn method_of(message: &Value) -> Option<&str> {
    message.get("method").and_then(Value::as_str)
}

/// Build an error response addressed to the id of `request`
pub fn error_reply(request: &Value, error: JsonRpcError) -> Value {
    JsonRpcResponse::error(JsonRpcId::from_message(request), error).into_value()
}

// =============================================================================
// MCP Initialize Types
// =============================================================================

/// Client info sent during initialize
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Implementation {
    pub fn this_proxy() -> Self {
        Self {
            name: "metamcp-proxy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Initialize request params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    pub client_info: Implementation,
}

/// Initialize response result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    pub server_info: Implementation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// =============================================================================
// Routed request params
// =============================================================================

/// tools/call and prompts/get params; arguments are relayed untouched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedCallParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// resources/read request params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceReadParams {
    pub uri: String,
}
