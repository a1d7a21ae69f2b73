//! Connection Pool
//!
//! Maps a session key to a [`Connection`]: the client leg handed in by the
//! front end and the backing leg built by the transport factory. Each key has
//! at most one live backing transport.
//!
//! # Lifecycle
//!
//! ```text
//! absent -> connecting -> connected -> closing -> absent
//! ```
//!
//! Pre-warmed backing transports for stored servers wait in an
//! [`IdleSessionCache`] keyed by server UUID and are taken by the next
//! session whose parameters still match.

pub mod idle;
pub mod relay;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use metamcp_shared::{ServerId, ServerParameters};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::mcp::TransportError;
use crate::transport::{Transport, TransportConnector, TransportRequest};

pub use idle::IdleSessionCache;
pub use relay::{bridge, Activity};

/// How often the reaper looks for idle connections
pub const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Error type for pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Pool is shutting down")]
    ShuttingDown,

    #[error("Unknown API key")]
    UnknownApiKey,

    #[error(transparent)]
    Setup(#[from] TransportError),
}

impl PoolError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PoolError::Setup(e) if e.is_transient())
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Where a key is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Absent,
    Connecting,
    Connected,
}

/// A client leg paired with its backing leg
pub struct Connection {
    pub id: Uuid,
    pub key: String,
    pub server_name: String,
    pub server_uuid: Option<ServerId>,
    pub created_at: OffsetDateTime,
    /// Backing leg came from the idle cache
    pub reused_idle: bool,
    client: Arc<dyn Transport>,
    backing: Arc<dyn Transport>,
    activity: Arc<Activity>,
}

impl Connection {
    pub fn client(&self) -> &Arc<dyn Transport> {
        &self.client
    }

    pub fn backing(&self) -> &Arc<dyn Transport> {
        &self.backing
    }

    pub fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed() || self.backing.is_closed()
    }

    async fn close(&self) {
        self.client.close().await;
        self.backing.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("server_name", &self.server_name)
            .field("backing", &self.backing.kind())
            .field("reused_idle", &self.reused_idle)
            .finish()
    }
}

/// Pool counters reported by health and status routes
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub active_connections: usize,
    pub connecting: usize,
    pub idle_sessions: usize,
    pub shutting_down: bool,
}

/// Pool tuning
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub idle_timeout: Duration,
    /// Replace idle sessions eagerly after they are taken or invalidated
    pub rewarm: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(1800),
            rewarm: true,
        }
    }
}

struct PoolInner {
    connector: Arc<dyn TransportConnector>,
    settings: PoolSettings,
    idle: IdleSessionCache<ServerId>,
    connections: StdMutex<HashMap<String, Arc<Connection>>>,
    connecting: StdMutex<HashSet<String>>,
    key_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    shutdown: CancellationToken,
}

/// Session table for direct (single server) connections
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn TransportConnector>, settings: PoolSettings) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                settings,
                idle: IdleSessionCache::new(),
                connections: StdMutex::new(HashMap::new()),
                connecting: StdMutex::new(HashSet::new()),
                key_locks: StdMutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Connection>> {
        self.inner
            .connections
            .lock()
            .ok()
            .and_then(|connections| connections.get(key).cloned())
    }

    pub fn state(&self, key: &str) -> ConnectionState {
        if self.get(key).is_some() {
            return ConnectionState::Connected;
        }
        let connecting = self
            .inner
            .connecting
            .lock()
            .map(|set| set.contains(key))
            .unwrap_or(false);
        if connecting {
            ConnectionState::Connecting
        } else {
            ConnectionState::Absent
        }
    }

    /// Pair `client_leg` with a backing transport for `request` under `key`.
    ///
    /// A live key returns the existing connection and closes `client_leg`.
    /// When the backing leg cannot be started `client_leg` is closed before
    /// the error is returned.
    pub async fn create(
        &self,
        key: &str,
        request: &TransportRequest,
        client_leg: Arc<dyn Transport>,
    ) -> PoolResult<Arc<Connection>> {
        if self.is_shutting_down() {
            client_leg.close().await;
            return Err(PoolError::ShuttingDown);
        }

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        if let Some(existing) = self.get(key) {
            if !existing.is_closed() {
                tracing::debug!(key = %key, "Connection already live; closing redundant client leg");
                client_leg.close().await;
                return Ok(existing);
            }
            self.remove_entry(key, existing.id);
        }

        self.mark_connecting(key, true);
        let backing = self.backing_for(request).await;
        self.mark_connecting(key, false);

        let (backing, reused_idle) = match backing {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    server = %request.server_name,
                    error = %e,
                    "Failed to create backing transport"
                );
                client_leg.close().await;
                return Err(e.into());
            }
        };

        if self.is_shutting_down() {
            client_leg.close().await;
            backing.close().await;
            return Err(PoolError::ShuttingDown);
        }

        let connection = Arc::new(Connection {
            id: Uuid::new_v4(),
            key: key.to_string(),
            server_name: request.server_name.clone(),
            server_uuid: request.server_uuid(),
            created_at: OffsetDateTime::now_utc(),
            reused_idle,
            client: client_leg,
            backing,
            activity: Arc::new(Activity::new()),
        });

        if let Ok(mut connections) = self.inner.connections.lock() {
            connections.insert(key.to_string(), connection.clone());
        }
        self.spawn_relay(connection.clone());

        if reused_idle && self.inner.settings.rewarm {
            if let Some(server) = request.server.clone() {
                self.spawn_warm(server);
            }
        }

        tracing::info!(
            key = %key,
            server = %connection.server_name,
            transport = %connection.backing.kind(),
            reused_idle = reused_idle,
            "Connection created"
        );
        Ok(connection)
    }

    /// Close both legs of `key` and forget it. Idempotent.
    ///
    /// Waits for a create in flight on the same key and closes what it built.
    pub async fn close(&self, key: &str) {
        let lock = self.key_lock(key);
        {
            let _guard = lock.lock().await;
            let removed = self
                .inner
                .connections
                .lock()
                .ok()
                .and_then(|mut connections| connections.remove(key));

            if let Some(connection) = removed {
                connection.close().await;
                tracing::info!(key = %key, server = %connection.server_name, "Connection closed");
            }
        }
        drop(lock);
        self.release_key_lock(key);
    }

    /// Tear down the idle session of `server_uuid` and, with re-warm
    /// enabled, start a replacement from `new_params`. Live connections
    /// keep their backing transport.
    pub async fn invalidate_idle_session(
        &self,
        server_uuid: ServerId,
        new_params: Option<ServerParameters>,
    ) {
        self.inner.idle.invalidate(&server_uuid).await;

        if !self.inner.settings.rewarm || self.is_shutting_down() {
            return;
        }
        if let Some(params) = new_params.filter(ServerParameters::is_active) {
            self.spawn_warm(params);
        }
    }

    /// Pre-warm an idle session for `params`. Best effort.
    pub async fn warm_idle_session(&self, params: ServerParameters) -> bool {
        if self.is_shutting_down() || !params.is_active() {
            return false;
        }
        let request = TransportRequest::from_server(&params);
        let connector = self.inner.connector.clone();
        self.inner
            .idle
            .warm(params.uuid, params.fingerprint(), async move {
                connector.connect(&request).await
            })
            .await
    }

    /// Close connections that have not relayed anything for the idle timeout
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.inner.settings.idle_timeout;
        let expired: Vec<String> = self
            .inner
            .connections
            .lock()
            .map(|connections| {
                connections
                    .values()
                    .filter(|c| c.idle_for() >= idle_timeout)
                    .map(|c| c.key.clone())
                    .collect()
            })
            .unwrap_or_default();

        for key in &expired {
            tracing::info!(key = %key, "Closing idle connection");
            self.close(key).await;
        }
        expired.len()
    }

    /// Run [`reap_idle`](Self::reap_idle) every `interval` until shutdown
    pub fn spawn_reaper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = pool.reap_idle().await;
                        if reaped > 0 {
                            tracing::debug!(reaped = reaped, "Idle connections reaped");
                        }
                    }
                    _ = pool.inner.shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Close every connection and idle session; refuse new ones
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let drained: Vec<Arc<Connection>> = self
            .inner
            .connections
            .lock()
            .map(|mut connections| connections.drain().map(|(_, c)| c).collect())
            .unwrap_or_default();
        let count = drained.len();

        futures::future::join_all(drained.iter().map(|c| c.close())).await;
        self.inner.idle.clear().await;

        tracing::info!(connections = count, "Connection pool shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
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

    pub fn idle_sessions(&self) -> usize {
        self.inner.idle.len()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            active_connections: self.len(),
            connecting: self
                .inner
                .connecting
                .lock()
                .map(|set| set.len())
                .unwrap_or(0),
            idle_sessions: self.idle_sessions(),
            shutting_down: self.is_shutting_down(),
        }
    }

    async fn backing_for(
        &self,
        request: &TransportRequest,
    ) -> Result<(Arc<dyn Transport>, bool), TransportError> {
        if let Some((server_uuid, fingerprint)) = request.idle_key() {
            if let Some(transport) = self.inner.idle.take(&server_uuid, &fingerprint).await {
                return Ok((transport, true));
            }
        }
        let transport = self.inner.connector.connect(request).await?;
        Ok((transport, false))
    }

    fn spawn_relay(&self, connection: Arc<Connection>) {
        let pool = self.clone();
        tokio::spawn(async move {
            bridge(
                &connection.key,
                connection.client.clone(),
                connection.backing.clone(),
                connection.activity.clone(),
            )
            .await;

            if pool.remove_entry(&connection.key, connection.id) {
                tracing::info!(
                    key = %connection.key,
                    server = %connection.server_name,
                    "Connection ended"
                );
            }
        });
    }

    fn spawn_warm(&self, params: ServerParameters) {
        let pool = self.clone();
        tokio::spawn(async move {
            pool.warm_idle_session(params).await;
        });
    }

    /// Remove `key` only if it still maps to connection `id`
    fn remove_entry(&self, key: &str, id: Uuid) -> bool {
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

    /// Drop the key lock unless a create is holding or waiting on it
    fn release_key_lock(&self, key: &str) {
        if let Ok(mut locks) = self.inner.key_locks.lock() {
            if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(key);
            }
        }
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        match self.inner.key_locks.lock() {
            Ok(mut locks) => locks.entry(key.to_string()).or_default().clone(),
            Err(_) => Arc::new(Mutex::new(())),
        }
    }

    fn mark_connecting(&self, key: &str, connecting: bool) {
        if let Ok(mut set) = self.inner.connecting.lock() {
            if connecting {
                set.insert(key.to_string());
            } else {
                set.remove(key);
            }
        }
    }
}
