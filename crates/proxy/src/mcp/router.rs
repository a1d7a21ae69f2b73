//! MCP Request Router
//!
//! Handles routing of aggregated MCP requests to the member server that owns
//! the tool, prompt or resource.
//!
//! # Namespacing
//!
//! Tools and prompts are namespaced as `{server_name}__{name}`
//! (e.g., `github__create_issue`). Resource URIs are left untouched and routed
//! through an owner table built while listing.

use std::collections::HashMap;

use serde_json::Value;

/// Separator between the server name and the original name
pub const NAME_SEPARATOR: &str = "__";

/// Parsed tool or prompt name with server prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    /// Member server name (e.g., "github")
    pub server_name: String,
    /// Name as the member server knows it (e.g., "create_issue")
    pub name: String,
}

/// Prefix a tool or prompt name with its server name
pub fn prefix_name(server_name: &str, name: &str) -> String {
    format!("{}{}{}", server_name, NAME_SEPARATOR, name)
}

/// Split a prefixed name at the first separator
pub fn parse_name(prefixed: &str) -> Option<ParsedName> {
    let (server_name, name) = prefixed.split_once(NAME_SEPARATOR)?;
    if server_name.is_empty() || name.is_empty() {
        return None;
    }
    Some(ParsedName {
        server_name: server_name.to_string(),
        name: name.to_string(),
    })
}

/// Rewrite the `name` field of every listed item in place.
///
/// Items are raw JSON so any field the proxy does not know about survives.
pub fn prefix_items(server_name: &str, items: Vec<Value>) -> Vec<Value> {
    items
        .into_iter()
        .map(|mut item| {
            if let Some(name) = item.get("name").and_then(Value::as_str) {
                let prefixed = prefix_name(server_name, name);
                item["name"] = Value::String(prefixed);
            }
            item
        })
        .collect()
}

/// Which member server listed each resource URI
#[derive(Debug, Default, Clone)]
pub struct ResourceOwners {
    owners: HashMap<String, String>,
}

impl ResourceOwners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the owner of every `uri` in a resources/list page
    pub fn record(&mut self, server_name: &str, resources: &[Value]) {
        for uri in resources
            .iter()
            .filter_map(|resource| resource.get("uri").and_then(Value::as_str))
        {
            self.owners
                .entry(uri.to_string())
                .or_insert_with(|| server_name.to_string());
        }
    }

    pub fn owner_of(&self, uri: &str) -> Option<&str> {
        self.owners.get(uri).map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.owners.clear();
    }
}

/// Types of MCP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpMethod {
    Initialize,
    Ping,
    Notification,
    ToolsList,
    ToolsCall,
    ResourcesList,
    ResourceTemplatesList,
    ResourcesRead,
    PromptsList,
    PromptsGet,
    Unknown,
}

impl McpMethod {
    /// Determine which MCP method a name maps to
    pub fn from_name(method: &str) -> Self {
        match method {
            "initialize" => McpMethod::Initialize,
            "ping" => McpMethod::Ping,
            "tools/list" => McpMethod::ToolsList,
            "tools/call" => McpMethod::ToolsCall,
            "resources/list" => McpMethod::ResourcesList,
            "resources/templates/list" => McpMethod::ResourceTemplatesList,
            "resources/read" => McpMethod::ResourcesRead,
            "prompts/list" => McpMethod::PromptsList,
            "prompts/get" => McpMethod::PromptsGet,
            m if m.starts_with("notifications/") => McpMethod::Notification,
            _ => McpMethod::Unknown,
        }
    }

    /// Does this method require routing to a specific member?
    pub fn requires_routing(&self) -> bool {
        matches!(
            self,
            McpMethod::ToolsCall | McpMethod::ResourcesRead | McpMethod::PromptsGet
        )
    }

    /// Does this method aggregate results from all members?
    pub fn aggregates_results(&self) -> bool {
        matches!(
            self,
            McpMethod::ToolsList
                | McpMethod::ResourcesList
                | McpMethod::ResourceTemplatesList
                | McpMethod::PromptsList
        )
    }

    /// Answered by the aggregator itself without touching a member
    pub fn is_proxy_handled(&self) -> bool {
        matches!(
            self,
            McpMethod::Initialize | McpMethod::Ping | McpMethod::Notification
        )
    }

    /// Key of the result array a list method returns
    pub fn list_key(&self) -> Option<&'static str> {
        match self {
            McpMethod::ToolsList => Some("tools"),
            McpMethod::ResourcesList => Some("resources"),
            McpMethod::ResourceTemplatesList => Some("resourceTemplates"),
            McpMethod::PromptsList => Some("prompts"),
            _ => None,
        }
    }

    /// Whether listed items get their `name` prefixed
    pub fn prefixes_names(&self) -> bool {
        matches!(self, McpMethod::ToolsList | McpMethod::PromptsList)
    }
}
