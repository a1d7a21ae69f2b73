//! MetaMCP Pool
//!
//! Connections from clients to aggregated namespaces. Each connection is
//! keyed by the API key plus the client's session id, so several sessions
//! can share one key without sharing a backing transport.
//!
//! The backing transport (an `aggregate` subprocess, or an in-process
//! aggregator task) is only started once the client sends its first message.
//! Pre-warmed backing transports wait in a per-API-key idle cache whose
//! fingerprint is the namespace UUID.

pub mod aggregator;
pub mod connector;
pub mod server;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use metamcp_shared::{ConfigRepository, NamespaceId};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::mcp::types::{error_reply, JsonRpcError, MessageKind};
use crate::pool::{bridge, Activity, IdleSessionCache, PoolError, PoolResult};
use crate::transport::{NamespaceConnector, Transport};

pub use aggregator::NamespaceAggregator;
pub use connector::InProcessAggregatorConnector;
pub use server::serve_transport;

/// API key plus client session
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MetaMcpKey {
    pub api_key: String,
    pub session_id: String,
}

impl MetaMcpKey {
    pub fn new(api_key: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            session_id: session_id.into(),
        }
    }
}

/// Only the first characters of the key ever reach the logs
fn key_hint(api_key: &str) -> String {
    let visible: String = api_key.chars().take(6).collect();
    format!("{}…", visible)
}

impl fmt::Display for MetaMcpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", key_hint(&self.api_key), self.session_id)
    }
}

impl fmt::Debug for MetaMcpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MetaMcpKey({})", self)
    }
}

/// Idle cache key; displays redacted
#[derive(Clone, PartialEq, Eq, Hash)]
struct ApiKey(String);

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&key_hint(&self.0))
    }
}

/// Client transport with a backing transport that appears on first use
pub struct MetaMcpConnection {
    pub id: Uuid,
    pub key: MetaMcpKey,
    pub namespace_uuid: NamespaceId,
    pub created_at: OffsetDateTime,
    client: Arc<dyn Transport>,
    backing: Mutex<Option<Arc<dyn Transport>>>,
    activity: Arc<Activity>,
}

impl MetaMcpConnection {
    pub fn client(&self) -> &Arc<dyn Transport> {
        &self.client
    }

    /// Backing transport, once the aggregated server was invoked
    pub async fn backing(&self) -> Option<Arc<dyn Transport>> {
        self.backing.lock().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    async fn close(&self) {
        self.client.close().await;
        if let Some(backing) = self.backing.lock().await.take() {
            backing.close().await;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaMcpStatus {
    pub connections: usize,
    pub idle_sessions: usize,
}

struct MetaMcpInner {
    repository: Arc<dyn ConfigRepository>,
    connector: Arc<dyn NamespaceConnector>,
    rewarm: bool,
    idle: IdleSessionCache<ApiKey>,
    connections: StdMutex<HashMap<MetaMcpKey, Arc<MetaMcpConnection>>>,
    key_locks: StdMutex<HashMap<MetaMcpKey, Arc<Mutex<()>>>>,
    shutdown: CancellationToken,
}

/// Session table for aggregated namespace connections
#[derive(Clone)]
pub struct MetaMcpPool {
    inner: Arc<MetaMcpInner>,
}

impl MetaMcpPool {
    pub fn new(
        repository: Arc<dyn ConfigRepository>,
        connector: Arc<dyn NamespaceConnector>,
        rewarm: bool,
    ) -> Self {
        Self {
            inner: Arc::new(MetaMcpInner {
                repository,
                connector,
                rewarm,
                idle: IdleSessionCache::new(),
                connections: StdMutex::new(HashMap::new()),
                key_locks: StdMutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn get(&self, key: &MetaMcpKey) -> Option<Arc<MetaMcpConnection>> {
        self.inner
            .connections
            .lock()
            .ok()
            .and_then(|connections| connections.get(key).cloned())
    }

    /// Register `client_leg` for `key`.
    ///
    /// The API key must be bound to a namespace. The backing transport is
    /// started when the first client message arrives. A live key returns the
    /// existing connection and closes `client_leg`.
    pub async fn attach(
        &self,
        key: MetaMcpKey,
        client_leg: Arc<dyn Transport>,
    ) -> PoolResult<Arc<MetaMcpConnection>> {
        if self.inner.shutdown.is_cancelled() {
            client_leg.close().await;
            return Err(PoolError::ShuttingDown);
        }

        let Some(namespace) = self.inner.repository.namespace_for_api_key(&key.api_key).await else {
            tracing::warn!(key = %key, "Rejected unknown API key");
            client_leg.close().await;
            return Err(PoolError::UnknownApiKey);
        };

        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        if let Some(existing) = self.get(&key) {
            if !existing.is_closed() {
                client_leg.close().await;
                return Ok(existing);
            }
        }

        let connection = Arc::new(MetaMcpConnection {
            id: Uuid::new_v4(),
            key: key.clone(),
            namespace_uuid: namespace.uuid,
            created_at: OffsetDateTime::now_utc(),
            client: client_leg,
            backing: Mutex::new(None),
            activity: Arc::new(Activity::new()),
        });
        if let Ok(mut connections) = self.inner.connections.lock() {
            connections.insert(key.clone(), connection.clone());
        }

        let pool = self.clone();
        let driven = connection.clone();
        tokio::spawn(async move { pool.drive(driven).await });

        tracing::info!(key = %key, namespace = %namespace.name, "MetaMCP connection attached");
        Ok(connection)
    }

    /// Wait for the first client message, start the backing transport and
    /// relay until either side closes
    async fn drive(&self, connection: Arc<MetaMcpConnection>) {
        let key = connection.key.clone();

        let Some(first) = connection.client.recv().await else {
            self.remove_entry(&key, connection.id);
            return;
        };

        match self.backing_for(&connection).await {
            Ok((backing, reused_idle)) => {
                *connection.backing.lock().await = Some(backing.clone());

                if reused_idle && self.inner.rewarm {
                    self.spawn_warm(key.api_key.clone(), connection.namespace_uuid);
                }

                connection.activity.touch();
                if let Err(e) = backing.send(first.clone()).await {
                    tracing::warn!(key = %key, error = %e, "Failed to deliver first message");
                    if MessageKind::of(&first) == MessageKind::Request {
                        let reply = error_reply(&first, JsonRpcError::internal_error(e.to_string()));
                        if let Err(e) = connection.client.send(reply).await {
                            tracing::debug!(key = %key, error = %e, "Client left before the error reply");
                        }
                    }
                }

                let label = key.to_string();
                bridge(
                    &label,
                    connection.client.clone(),
                    backing,
                    connection.activity.clone(),
                )
                .await;
            }
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Failed to start aggregated namespace");
                if MessageKind::of(&first) == MessageKind::Request {
                    let reply = error_reply(
                        &first,
                        JsonRpcError::connection_closed(format!("Namespace unavailable: {}", e)),
                    );
                    if let Err(e) = connection.client.send(reply).await {
                        tracing::debug!(key = %key, error = %e, "Client left before the error reply");
                    }
                }
                connection.client.close().await;
            }
        }

        if self.remove_entry(&key, connection.id) {
            tracing::info!(key = %key, "MetaMCP connection ended");
        }
    }

    async fn backing_for(
        &self,
        connection: &MetaMcpConnection,
    ) -> crate::mcp::TransportResult<(Arc<dyn Transport>, bool)> {
        let api_key = ApiKey(connection.key.api_key.clone());
        let fingerprint = connection.namespace_uuid.to_string();
        if let Some(transport) = self.inner.idle.take(&api_key, &fingerprint).await {
            return Ok((transport, true));
        }
        let transport = self
            .inner
            .connector
            .connect_namespace(&connection.key.api_key)
            .await?;
        Ok((transport, false))
    }

    /// Close the connection for `key`. Idempotent.
    pub async fn close(&self, key: &MetaMcpKey) {
        let removed = self
            .inner
            .connections
            .lock()
            .ok()
            .and_then(|mut connections| connections.remove(key));
        self.release_key_lock(key);

        if let Some(connection) = removed {
            connection.close().await;
            tracing::info!(key = %key, "MetaMCP connection closed");
        }
    }

    /// Pre-warm a namespace server for `api_key`. Best effort.
    pub async fn warm_idle_session(&self, api_key: String) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }
        let Some(namespace) = self.inner.repository.namespace_for_api_key(&api_key).await else {
            return false;
        };
        let connector = self.inner.connector.clone();
        let key = api_key.clone();
        self.inner
            .idle
            .warm(ApiKey(api_key), namespace.uuid.to_string(), async move {
                connector.connect_namespace(&key).await
            })
            .await
    }

    /// Tear down idle namespace servers of `namespaces` and, with re-warm
    /// enabled, start replacements that read the current configuration.
    /// Live connections are untouched.
    pub async fn invalidate_idle_servers(&self, namespaces: &[NamespaceId]) {
        let wanted: Vec<String> = namespaces.iter().map(NamespaceId::to_string).collect();
        let keys = self
            .inner
            .idle
            .keys_where(|_, fingerprint| wanted.iter().any(|ns| ns == fingerprint));

        for key in keys {
            self.inner.idle.invalidate(&key).await;
            if self.inner.rewarm && !self.inner.shutdown.is_cancelled() {
                let ApiKey(api_key) = key;
                let pool = self.clone();
                tokio::spawn(async move {
                    pool.warm_idle_session(api_key).await;
                });
            }
        }
    }

    /// Close every connection and idle session; refuse new ones
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let drained: Vec<Arc<MetaMcpConnection>> = self
            .inner
            .connections
            .lock()
            .map(|mut connections| connections.drain().map(|(_, c)| c).collect())
            .unwrap_or_default();
        let count = drained.len();

        futures::future::join_all(drained.iter().map(|c| c.close())).await;
        self.inner.idle.clear().await;

        tracing::info!(connections = count, "MetaMCP pool shut down");
    }

    pub fn len(&self) -> usize {
        self.inner
            .connections
            .lock()
            .map(|connections| connections.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> MetaMcpStatus {
        MetaMcpStatus {
            connections: self.len(),
            idle_sessions: self.inner.idle.len(),
        }
    }

    fn spawn_warm(&self, api_key: String, namespace: NamespaceId) {
        let pool = self.clone();
        tokio::spawn(async move {
            if !pool.warm_idle_session(api_key).await {
                tracing::debug!(namespace = %namespace, "Namespace server not re-warmed");
            }
        });
    }

    fn remove_entry(&self, key: &MetaMcpKey, id: Uuid) -> bool {
        let removed = self
            .inner
            .connections
            .lock()
            .map(|mut connections| match connections.get(key) {
                Some(current) if current.id == id => connections.remove(key).is_some(),
                _ => false,
            })
            .unwrap_or(false);
        if removed {
            self.release_key_lock(key);
        }
        removed
    }

    fn key_lock(&self, key: &MetaMcpKey) -> Arc<Mutex<()>> {
        match self.inner.key_locks.lock() {
            Ok(mut locks) => locks.entry(key.clone()).or_default().clone(),
            Err(_) => Arc::new(Mutex::new(())),
        }
    }

    fn release_key_lock(&self, key: &MetaMcpKey) {
        if let Ok(mut locks) = self.inner.key_locks.lock() {
            if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(key);
            }
        }
    }
}
