//! Serve a [`NamespaceAggregator`] over a transport

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::aggregator::{client_notification, NamespaceAggregator};
use crate::transport::Transport;

/// Answer messages arriving on `transport` until it closes.
///
/// Requests are handled concurrently so one slow member does not hold up
/// unrelated calls. Replies are therefore sent in completion order, not
/// arrival order; clients match them by id. Member notifications are
/// relayed as they arrive. Members are shut down when the transport ends.
pub async fn serve_transport(aggregator: Arc<NamespaceAggregator>, transport: Arc<dyn Transport>) {
    tracing::info!(
        namespace = %aggregator.namespace().name,
        transport = %transport.kind(),
        "Serving namespace"
    );
    let relay = relay_notifications(&aggregator, transport.clone());

    while let Some(message) = transport.recv().await {
        let aggregator = aggregator.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            let reply = match message {
                Value::Array(batch) => {
                    let replies: Vec<Value> = join_all(batch.into_iter().map(|m| aggregator.handle(m)))
                        .await
                        .into_iter()
                        .flatten()
                        .collect();
                    (!replies.is_empty()).then_some(Value::Array(replies))
                }
                message => aggregator.handle(message).await,
            };

            if let Some(reply) = reply {
                if let Err(e) = transport.send(reply).await {
                    tracing::debug!(error = %e, "Failed to deliver aggregated reply");
                }
            }
        });
    }

    relay.abort();
    aggregator.shutdown().await;
    tracing::info!(namespace = %aggregator.namespace().name, "Namespace transport closed");
}

fn relay_notifications(aggregator: &NamespaceAggregator, transport: Arc<dyn Transport>) -> JoinHandle<()> {
    let mut notifications = aggregator.subscribe_notifications();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(notification) => {
                    let Some(message) = client_notification(notification) else {
                        continue;
                    };
                    if let Err(e) = transport.send(message).await {
                        tracing::debug!(error = %e, "Failed to deliver member notification");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Member notifications dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::logs::ServerLogStore;
    use crate::test_support::FakeConnector;
    use crate::transport::ChannelTransport;
    use metamcp_shared::{
        McpServerType, NamespaceId, NamespaceSnapshot, ServerId, ServerParameters, ServerStatus,
        StderrMode,
    };
    use std::collections::BTreeMap;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_serves_requests_and_batches() {
        let aggregator = Arc::new(NamespaceAggregator::new(
            NamespaceSnapshot {
                uuid: NamespaceId::new(),
                name: "empty".to_string(),
                servers: Vec::new(),
            },
            Arc::new(FakeConnector::default()),
            ServerLogStore::default(),
            Duration::from_secs(5),
        ));
        let (client, server) = ChannelTransport::pair();
        let serving = tokio::spawn(serve_transport(aggregator, server));

        client
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await
            .unwrap();
        assert_eq!(client.recv().await.unwrap()["id"], 1);

        client
            .send(json!([
                {"jsonrpc": "2.0", "id": 2, "method": "ping"},
                {"jsonrpc": "2.0", "method": "notifications/initialized"},
                {"jsonrpc": "2.0", "id": 3, "method": "tools/list"}
            ]))
            .await
            .unwrap();
        let batch = client.recv().await.unwrap();
        assert_eq!(batch.as_array().unwrap().len(), 2);

        client.close().await;
        serving.await.unwrap();
    }

    fn member(name: &str) -> ServerParameters {
        ServerParameters {
            uuid: ServerId::new(),
            name: name.to_string(),
            server_type: McpServerType::Stdio,
            command: Some("node".to_string()),
            args: Vec::new(),
            env: BTreeMap::new(),
            url: None,
            bearer_token: None,
            stderr_mode: StderrMode::Pipe,
            status: ServerStatus::Active,
        }
    }

    fn serve(connector: FakeConnector, servers: Vec<ServerParameters>) -> Arc<ChannelTransport> {
        let aggregator = Arc::new(NamespaceAggregator::new(
            NamespaceSnapshot {
                uuid: NamespaceId::new(),
                name: "research".to_string(),
                servers,
            },
            Arc::new(connector),
            ServerLogStore::default(),
            Duration::from_secs(5),
        ));
        let (client, server) = ChannelTransport::pair();
        tokio::spawn(serve_transport(aggregator, server));
        client
    }

    #[tokio::test]
    async fn test_member_notifications_reach_client() {
        let client = serve(
            FakeConnector::with_tools(&["search"]),
            vec![member("ServerA")],
        );

        client
            .send(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "tools/call",
                "params": {"name": "ServerA__search", "_meta": {"progressToken": "job-7"}}
            }))
            .await
            .unwrap();

        let mut received = Vec::new();
        for _ in 0..2 {
            let message = tokio::time::timeout(Duration::from_secs(5), client.recv())
                .await
                .unwrap()
                .unwrap();
            received.push(message);
        }
        let progress = received
            .iter()
            .find(|m| m["method"] == "notifications/progress")
            .unwrap();
        assert_eq!(progress["params"]["progressToken"], "job-7");
        let reply = received.iter().find(|m| m["id"] == 1).unwrap();
        assert_eq!(reply["result"]["content"][0]["text"], "ServerA:search");
    }

    #[tokio::test]
    async fn test_slow_call_does_not_hold_up_later_replies() {
        let client = serve(
            FakeConnector::with_tools(&["search"]).unanswered("tools/call"),
            vec![member("ServerA")],
        );

        client
            .send(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "tools/call",
                "params": {"name": "ServerA__search"}
            }))
            .await
            .unwrap();
        client
            .send(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
            .await
            .unwrap();

        // The ping reply overtakes the pending call
        let first = tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first["id"], 2);
        client.close().await;
    }
}
