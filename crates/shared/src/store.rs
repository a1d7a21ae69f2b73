//! Configuration storage seam
//!
//! Server parameters, namespace membership and API keys are owned by an
//! external configuration service. The proxy only reads them through
//! [`ConfigRepository`]; the in-memory implementation here is what the proxy
//! runs with when it is seeded from a JSON document or driven through its
//! internal HTTP API.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::types::{ApiKeyBinding, Namespace, NamespaceId, NamespaceSnapshot, ServerId, ServerParameters};

/// Read/write access to proxy configuration
#[async_trait]
pub trait ConfigRepository: Send + Sync {
    async fn server(&self, id: ServerId) -> Option<ServerParameters>;

    async fn servers(&self) -> Vec<ServerParameters>;

    async fn namespace(&self, id: NamespaceId) -> Option<NamespaceSnapshot>;

    /// Resolve the namespace an API key grants access to
    async fn namespace_for_api_key(&self, api_key: &str) -> Option<NamespaceSnapshot>;

    /// Namespaces that include the given server
    async fn namespaces_containing(&self, id: ServerId) -> Vec<NamespaceId>;

    /// Insert or replace a server; returns the namespaces it belongs to
    async fn upsert_server(&self, params: ServerParameters) -> StoreResult<Vec<NamespaceId>>;

    async fn upsert_namespace(&self, namespace: Namespace) -> StoreResult<()>;

    async fn bind_api_key(&self, binding: ApiKeyBinding) -> StoreResult<()>;
}

/// On-disk seed format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub servers: Vec<ServerParameters>,
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyBinding>,
}

impl ConfigDocument {
    pub fn from_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Default)]
struct StoreState {
    servers: HashMap<ServerId, ServerParameters>,
    namespaces: HashMap<NamespaceId, Namespace>,
    api_keys: HashMap<String, NamespaceId>,
}

impl StoreState {
    fn snapshot(&self, id: NamespaceId) -> Option<NamespaceSnapshot> {
        let namespace = self.namespaces.get(&id)?;
        let servers = namespace
            .server_uuids
            .iter()
            .filter_map(|server_id| self.servers.get(server_id).cloned())
            .collect();

        Some(NamespaceSnapshot {
            uuid: namespace.uuid,
            name: namespace.name.clone(),
            servers,
        })
    }
}

/// Thread-safe in-memory configuration store
#[derive(Default)]
pub struct InMemoryConfigStore {
    state: RwLock<StoreState>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a seed document, validating references
    pub fn from_document(document: ConfigDocument) -> StoreResult<Self> {
        let mut state = StoreState::default();

        for server in document.servers {
            state.servers.insert(server.uuid, server);
        }

        for namespace in document.namespaces {
            if let Some(missing) = namespace
                .server_uuids
                .iter()
                .find(|id| !state.servers.contains_key(id))
            {
                return Err(StoreError::Validation(format!(
                    "namespace '{}' references unknown server {}",
                    namespace.name, missing
                )));
            }
            state.namespaces.insert(namespace.uuid, namespace);
        }

        for binding in document.api_keys {
            if !state.namespaces.contains_key(&binding.namespace_uuid) {
                return Err(StoreError::Validation(format!(
                    "API key bound to unknown namespace {}",
                    binding.namespace_uuid
                )));
            }
            state.api_keys.insert(binding.key, binding.namespace_uuid);
        }

        tracing::info!(
            servers = state.servers.len(),
            namespaces = state.namespaces.len(),
            api_keys = state.api_keys.len(),
            "Configuration store seeded"
        );

        Ok(Self {
            state: RwLock::new(state),
        })
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> Option<T> {
        self.state.read().ok().map(|state| f(&state))
    }

    fn write<T>(&self, f: impl FnOnce(&mut StoreState) -> StoreResult<T>) -> StoreResult<T> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::Validation("configuration store lock poisoned".to_string()))?;
        f(&mut state)
    }
}

#[async_trait]
impl ConfigRepository for InMemoryConfigStore {
    async fn server(&self, id: ServerId) -> Option<ServerParameters> {
        self.read(|state| state.servers.get(&id).cloned()).flatten()
    }

    async fn servers(&self) -> Vec<ServerParameters> {
        self.read(|state| state.servers.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn namespace(&self, id: NamespaceId) -> Option<NamespaceSnapshot> {
        self.read(|state| state.snapshot(id)).flatten()
    }

    async fn namespace_for_api_key(&self, api_key: &str) -> Option<NamespaceSnapshot> {
        self.read(|state| {
            let id = state.api_keys.get(api_key)?;
            state.snapshot(*id)
        })
        .flatten()
    }

    async fn namespaces_containing(&self, id: ServerId) -> Vec<NamespaceId> {
        self.read(|state| {
            let mut ids: Vec<NamespaceId> = state
                .namespaces
                .values()
                .filter(|ns| ns.server_uuids.contains(&id))
                .map(|ns| ns.uuid)
                .collect();
            ids.sort();
            ids
        })
        .unwrap_or_default()
    }

    async fn upsert_server(&self, params: ServerParameters) -> StoreResult<Vec<NamespaceId>> {
        if params.name.contains("__") {
            return Err(StoreError::Validation(format!(
                "server name '{}' must not contain '__'",
                params.name
            )));
        }

        let id = params.uuid;
        self.write(|state| {
            state.servers.insert(id, params);
            Ok(())
        })?;
        Ok(self.namespaces_containing(id).await)
    }

    async fn upsert_namespace(&self, namespace: Namespace) -> StoreResult<()> {
        self.write(|state| {
            if let Some(missing) = namespace
                .server_uuids
                .iter()
                .find(|id| !state.servers.contains_key(id))
            {
                return Err(StoreError::NotFound(format!("server {}", missing)));
            }
            state.namespaces.insert(namespace.uuid, namespace);
            Ok(())
        })
    }

    async fn bind_api_key(&self, binding: ApiKeyBinding) -> StoreResult<()> {
        self.write(|state| {
            if !state.namespaces.contains_key(&binding.namespace_uuid) {
                return Err(StoreError::NotFound(format!(
                    "namespace {}",
                    binding.namespace_uuid
                )));
            }
            state.api_keys.insert(binding.key, binding.namespace_uuid);
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{McpServerType, ServerStatus, StderrMode};
    use std::collections::BTreeMap;
    use std::io::Write;

    fn server(name: &str) -> ServerParameters {
        ServerParameters {
            uuid: ServerId::new(),
            name: name.to_string(),
            server_type: McpServerType::Sse,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            url: Some("http://localhost:9000/sse".to_string()),
            bearer_token: None,
            stderr_mode: StderrMode::Pipe,
            status: ServerStatus::Active,
        }
    }

    fn seeded() -> (InMemoryConfigStore, ServerParameters, Namespace) {
        let github = server("github");
        let namespace = Namespace {
            uuid: NamespaceId::new(),
            name: "dev".to_string(),
            server_uuids: vec![github.uuid],
        };
        let store = InMemoryConfigStore::from_document(ConfigDocument {
            servers: vec![github.clone()],
            namespaces: vec![namespace.clone()],
            api_keys: vec![ApiKeyBinding {
                key: "sk_mt_dev".to_string(),
                namespace_uuid: namespace.uuid,
            }],
        })
        .unwrap();
        (store, github, namespace)
    }

    #[tokio::test]
    async fn test_namespace_for_api_key() {
        let (store, github, namespace) = seeded();

        let snapshot = store.namespace_for_api_key("sk_mt_dev").await.unwrap();
        assert_eq!(snapshot.uuid, namespace.uuid);
        assert_eq!(snapshot.servers, vec![github]);

        assert!(store.namespace_for_api_key("sk_mt_unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_upsert_server_reports_affected_namespaces() {
        let (store, mut github, namespace) = seeded();
        github.url = Some("http://localhost:9100/sse".to_string());

        let affected = store.upsert_server(github.clone()).await.unwrap();
        assert_eq!(affected, vec![namespace.uuid]);
        assert_eq!(store.server(github.uuid).await.unwrap().url, github.url);
    }

    #[tokio::test]
    async fn test_upsert_server_rejects_separator_in_name() {
        let (store, _, _) = seeded();
        let result = store.upsert_server(server("bad__name")).await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_upsert_namespace_requires_known_servers() {
        let (store, _, _) = seeded();
        let result = store
            .upsert_namespace(Namespace {
                uuid: NamespaceId::new(),
                name: "broken".to_string(),
                server_uuids: vec![ServerId::new()],
            })
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_document_rejects_dangling_namespace_member() {
        let document = ConfigDocument {
            servers: Vec::new(),
            namespaces: vec![Namespace {
                uuid: NamespaceId::new(),
                name: "empty".to_string(),
                server_uuids: vec![ServerId::new()],
            }],
            api_keys: Vec::new(),
        };
        assert!(matches!(
            InMemoryConfigStore::from_document(document),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_document_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"servers": [], "namespaces": []}}"#).unwrap();

        let document = ConfigDocument::from_file(file.path()).unwrap();
        assert!(document.servers.is_empty());
        assert!(document.api_keys.is_empty());
    }
}
