//! In-process namespace connector
//!
//! Runs the aggregator as a task inside the proxy and hands back the client
//! end of an in-memory channel, for hosts where spawning the `aggregate`
//! subprocess is not possible.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metamcp_shared::ConfigRepository;

use super::aggregator::NamespaceAggregator;
use super::server::serve_transport;
use crate::logs::ServerLogStore;
use crate::mcp::{TransportError, TransportResult};
use crate::transport::{ChannelTransport, NamespaceConnector, Transport, TransportConnector};

pub struct InProcessAggregatorConnector {
    repository: Arc<dyn ConfigRepository>,
    connector: Arc<dyn TransportConnector>,
    logs: ServerLogStore,
    request_timeout: Duration,
}

impl InProcessAggregatorConnector {
    pub fn new(
        repository: Arc<dyn ConfigRepository>,
        connector: Arc<dyn TransportConnector>,
        logs: ServerLogStore,
        request_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            connector,
            logs,
            request_timeout,
        }
    }
}

#[async_trait]
impl NamespaceConnector for InProcessAggregatorConnector {
    async fn connect_namespace(&self, api_key: &str) -> TransportResult<Arc<dyn Transport>> {
        let snapshot = self
            .repository
            .namespace_for_api_key(api_key)
            .await
            .ok_or_else(|| TransportError::Unauthorized("unknown API key".to_string()))?;

        let aggregator = Arc::new(NamespaceAggregator::new(
            snapshot,
            self.connector.clone(),
            self.logs.clone(),
            self.request_timeout,
        ));
        let (client_end, server_end) = ChannelTransport::pair();
        tokio::spawn(serve_transport(aggregator, server_end));

        Ok(client_end)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::FakeConnector;
    use metamcp_shared::{ApiKeyBinding, InMemoryConfigStore, Namespace, NamespaceId};
    use serde_json::json;

    #[tokio::test]
    async fn test_connects_known_keys_only() {
        let store = InMemoryConfigStore::new();
        let namespace = NamespaceId::new();
        store
            .upsert_namespace(Namespace {
                uuid: namespace,
                name: "empty".to_string(),
                server_uuids: Vec::new(),
            })
            .await
            .unwrap();
        store
            .bind_api_key(ApiKeyBinding {
                key: "sk_live".to_string(),
                namespace_uuid: namespace,
            })
            .await
            .unwrap();

        let connector = InProcessAggregatorConnector::new(
            Arc::new(store),
            Arc::new(FakeConnector::default()),
            ServerLogStore::default(),
            Duration::from_secs(5),
        );

        let transport = connector.connect_namespace("sk_live").await.unwrap();
        transport
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await
            .unwrap();
        assert_eq!(transport.recv().await.unwrap()["result"], json!({}));

        let err = connector.connect_namespace("sk_other").await.err().unwrap();
        assert!(matches!(err, TransportError::Unauthorized(_)));
    }
}
