//! Client sessions of the HTTP front end
//!
//! A [`ClientSession`] owns the front-end end of the in-memory channel whose
//! other end is the client leg of a pool connection. A dispatcher task reads
//! what the backend sends and routes it: replies to streamable-HTTP POSTs go
//! to the waiting request, everything else to the session's event stream.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::mcp::types::{JsonRpcId, MessageKind};
use crate::mcp::TransportResult;
use crate::metamcp::MetaMcpKey;
use crate::pool::PoolError;
use crate::state::AppState;
use crate::transport::{ArgList, ChannelTransport, Transport, TransportRequest};

/// Server messages buffered per session while no stream is attached
const OUTBOUND_BUFFER: usize = 256;

/// Maximum number of retry attempts for transient setup failures
const MAX_RETRIES: usize = 3;

/// Initial backoff duration for retries (100ms)
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Maximum backoff duration for retries (5 seconds)
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Client-facing protocol of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Sse,
    StreamableHttp,
}

/// Pool entry a session is attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolKey {
    Direct(String),
    MetaMcp(MetaMcpKey),
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKey::Direct(key) => f.write_str(key),
            PoolKey::MetaMcp(key) => write!(f, "metamcp:{}", key),
        }
    }
}

/// Route family a session may be reached through
#[derive(Debug, Clone, Copy)]
pub enum SessionScope<'a> {
    Direct,
    /// Sessions opened with this API key
    Namespace(&'a str),
}

impl SessionScope<'_> {
    fn admits(&self, key: &PoolKey) -> bool {
        match (self, key) {
            (SessionScope::Direct, PoolKey::Direct(_)) => true,
            (SessionScope::Namespace(api_key), PoolKey::MetaMcp(key)) => key.api_key == *api_key,
            _ => false,
        }
    }
}

pub struct ClientSession {
    pub id: String,
    pub mode: SessionMode,
    pub pool_key: PoolKey,
    transport: Arc<ChannelTransport>,
    pending: Mutex<HashMap<JsonRpcId, oneshot::Sender<Value>>>,
    stream: Mutex<Option<mpsc::Receiver<Value>>>,
}

impl ClientSession {
    /// Register a session around `transport` and start its dispatcher
    pub fn start(
        registry: &SessionRegistry,
        id: String,
        mode: SessionMode,
        pool_key: PoolKey,
        transport: Arc<ChannelTransport>,
    ) -> Arc<Self> {
        let (outbound, stream) = mpsc::channel(OUTBOUND_BUFFER);
        let session = Arc::new(Self {
            id,
            mode,
            pool_key,
            transport,
            pending: Mutex::new(HashMap::new()),
            stream: Mutex::new(Some(stream)),
        });

        registry.insert(session.clone());
        tokio::spawn(dispatch(session.clone(), outbound, registry.clone()));

        tracing::info!(session_id = %session.id, key = %session.pool_key, mode = ?mode, "Client session started");
        session
    }

    /// Forward a client message to the backend
    pub async fn send(&self, message: Value) -> TransportResult<()> {
        self.transport.send(message).await
    }

    /// Forward a request and get a receiver for its reply.
    ///
    /// Notifications and responses yield `None`.
    pub async fn request(&self, message: Value) -> TransportResult<Option<oneshot::Receiver<Value>>> {
        let waiter = match (MessageKind::of(&message), JsonRpcId::from_message(&message)) {
            (MessageKind::Request, Some(id)) => {
                let (tx, rx) = oneshot::channel();
                if let Ok(mut pending) = self.pending.lock() {
                    pending.insert(id.clone(), tx);
                }
                Some((id, rx))
            }
            _ => None,
        };

        if let Err(e) = self.send(message).await {
            if let Some((id, _)) = &waiter {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(id);
                }
            }
            return Err(e);
        }
        Ok(waiter.map(|(_, rx)| rx))
    }

    /// Stop waiting for the reply to `request`
    pub fn forget(&self, request: &Value) {
        let Some(id) = JsonRpcId::from_message(request) else {
            return;
        };
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    /// Take the server-to-client stream; only one consumer may hold it
    pub fn take_stream(&self) -> Option<mpsc::Receiver<Value>> {
        self.stream.lock().ok().and_then(|mut stream| stream.take())
    }

    /// Hand a stream back so a later GET can pick it up again
    pub fn restore_stream(&self, stream: mpsc::Receiver<Value>) {
        if let Ok(mut slot) = self.stream.lock() {
            if slot.is_none() {
                *slot = Some(stream);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    async fn close_transport(&self) {
        self.transport.close().await;
    }
}

async fn dispatch(session: Arc<ClientSession>, outbound: mpsc::Sender<Value>, registry: SessionRegistry) {
    while let Some(message) = session.transport.recv().await {
        if session.mode == SessionMode::StreamableHttp && MessageKind::of(&message) == MessageKind::Response {
            let waiter = JsonRpcId::from_message(&message)
                .and_then(|id| session.pending.lock().ok().and_then(|mut p| p.remove(&id)));
            if let Some(waiter) = waiter {
                if waiter.send(message).is_err() {
                    tracing::debug!(session_id = %session.id, "Request gave up before its reply arrived");
                }
                continue;
            }
        }

        match session.mode {
            SessionMode::Sse => {
                if outbound.send(message).await.is_err() {
                    break;
                }
            }
            SessionMode::StreamableHttp => {
                if outbound.try_send(message).is_err() {
                    tracing::debug!(session_id = %session.id, "No open stream; dropping server message");
                }
            }
        }
    }

    registry.remove(&session.id);
    // Wakes every POST still waiting on a reply
    if let Ok(mut pending) = session.pending.lock() {
        pending.clear();
    }
    tracing::info!(session_id = %session.id, "Client session ended");
}

/// Live client sessions by id
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<ClientSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().ok().and_then(|s| s.get(id).cloned())
    }

    /// Look up a session opened with `mode` within `scope`
    pub fn find(&self, id: &str, mode: SessionMode, scope: SessionScope<'_>) -> Option<Arc<ClientSession>> {
        self.get(id)
            .filter(|session| session.mode == mode && scope.admits(&session.pool_key))
    }

    fn insert(&self, session: Arc<ClientSession>) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(session.id.clone(), session);
        }
    }

    fn remove(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.write().ok().and_then(|mut s| s.remove(id))
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Query parameters describing the backend of a direct session
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectQuery {
    pub transport_type: Option<String>,
    pub server_uuid: Option<Uuid>,
    pub command: Option<String>,
    /// Shell-style argument string
    pub args: Option<String>,
    /// JSON object of environment overrides
    pub env: Option<String>,
    pub url: Option<String>,
}

impl ConnectQuery {
    /// Resolve into a transport request, from stored configuration when a
    /// server UUID is given
    pub async fn into_request(self, state: &AppState, headers: HeaderMap) -> ApiResult<TransportRequest> {
        if let Some(uuid) = self.server_uuid {
            let params = state
                .repository
                .server(uuid.into())
                .await
                .ok_or(ApiError::NotFound)?;
            if !params.is_active() {
                return Err(ApiError::BadRequest(format!("Server '{}' is inactive", params.name)));
            }
            return Ok(TransportRequest::from_server(&params).with_inbound_headers(headers));
        }

        let transport_type = self
            .transport_type
            .ok_or_else(|| ApiError::Validation("transportType or serverUuid is required".to_string()))?;
        let env: BTreeMap<String, String> = match self.env.as_deref() {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)
                .map_err(|e| ApiError::Validation(format!("env must be a JSON object of strings: {}", e)))?,
            _ => BTreeMap::new(),
        };
        let server_name = self
            .command
            .clone()
            .or_else(|| self.url.clone())
            .unwrap_or_else(|| transport_type.clone());

        Ok(TransportRequest {
            transport_type,
            server_name,
            command: self.command,
            args: ArgList::Shell(self.args.unwrap_or_default()),
            env,
            url: self.url,
            ..Default::default()
        }
        .with_inbound_headers(headers))
    }
}

/// Create a direct pool connection and a session in front of it.
///
/// Timeouts are retried with exponential backoff; every attempt uses a
/// fresh channel because a failed create closes its client leg.
pub async fn open_direct_session(
    state: &AppState,
    mode: SessionMode,
    request: TransportRequest,
) -> ApiResult<Arc<ClientSession>> {
    use tokio_retry::strategy::{jitter, ExponentialBackoff};
    use tokio_retry::Retry;

    let session_id = Uuid::new_v4().to_string();

    let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
        .max_delay(RETRY_MAX_DELAY)
        .take(MAX_RETRIES)
        .map(jitter);

    let front = Retry::spawn(retry_strategy, || async {
        let (front, client_leg) = ChannelTransport::pair();
        let result = state
            .pool
            .create(&session_id, &request, client_leg)
            .await
            .map(|_| front);

        match &result {
            Ok(_) => Ok(result),
            Err(e) if e.is_transient() => {
                tracing::debug!(session_id = %session_id, error = %e, "Transient error - will retry");
                Err(result)
            }
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "Permanent error - will not retry");
                Ok(result)
            }
        }
    })
    .await
    .unwrap_or_else(|e| e)
    .map_err(|e| report_setup_failure(state, &request.server_name, e))?;

    Ok(ClientSession::start(
        &state.sessions,
        session_id.clone(),
        mode,
        PoolKey::Direct(session_id),
        front,
    ))
}

/// Attach a session to the namespace bound to `api_key`
pub async fn open_metamcp_session(
    state: &AppState,
    mode: SessionMode,
    api_key: &str,
) -> ApiResult<Arc<ClientSession>> {
    let session_id = Uuid::new_v4().to_string();
    let key = MetaMcpKey::new(api_key, session_id.clone());

    let (front, client_leg) = ChannelTransport::pair();
    state.metamcp.attach(key.clone(), client_leg).await?;

    Ok(ClientSession::start(
        &state.sessions,
        session_id,
        mode,
        PoolKey::MetaMcp(key),
        front,
    ))
}

/// Close a session and release its pool entry
pub async fn close_session(state: &AppState, session: &ClientSession) {
    session.close_transport().await;
    match &session.pool_key {
        PoolKey::Direct(key) => state.pool.close(key).await,
        PoolKey::MetaMcp(key) => state.metamcp.close(key).await,
    }
}

fn report_setup_failure(state: &AppState, server_name: &str, error: PoolError) -> ApiError {
    if let PoolError::Setup(e) = &error {
        state.logs.error(server_name, "Failed to connect to backend", e);
    }
    error.into()
}

/// Closes its session when dropped, i.e. when the client's stream goes away
pub struct SessionGuard {
    state: AppState,
    session: Arc<ClientSession>,
}

impl SessionGuard {
    pub fn new(state: AppState, session: Arc<ClientSession>) -> Self {
        Self { state, session }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let state = self.state.clone();
        let session = self.session.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tracing::debug!(session_id = %session.id, "Client stream dropped");
                close_session(&state, &session).await;
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::logs::ServerLogStore;
    use crate::metamcp::InProcessAggregatorConnector;
    use crate::test_support::FakeConnector;
    use metamcp_shared::{ConfigRepository, InMemoryConfigStore};
    use serde_json::json;

    #[tokio::test]
    async fn test_streamable_replies_reach_waiting_request() {
        let registry = SessionRegistry::new();
        let (front, backend) = ChannelTransport::pair();
        let session = ClientSession::start(
            &registry,
            "s-1".to_string(),
            SessionMode::StreamableHttp,
            PoolKey::Direct("s-1".to_string()),
            front,
        );
        assert!(registry.get("s-1").is_some());

        let waiter = session
            .request(json!({"jsonrpc": "2.0", "id": 9, "method": "ping"}))
            .await
            .unwrap()
            .unwrap();
        let forwarded = backend.recv().await.unwrap();
        assert_eq!(forwarded["method"], "ping");

        // Server-initiated message goes to the stream, the reply to the waiter
        backend
            .send(json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}))
            .await
            .unwrap();
        backend
            .send(json!({"jsonrpc": "2.0", "id": 9, "result": {}}))
            .await
            .unwrap();

        assert_eq!(waiter.await.unwrap()["id"], 9);
        let mut stream = session.take_stream().unwrap();
        assert_eq!(
            stream.recv().await.unwrap()["method"],
            "notifications/tools/list_changed"
        );
        assert!(session.take_stream().is_none());
    }

    #[tokio::test]
    async fn test_notifications_have_no_waiter() {
        let registry = SessionRegistry::new();
        let (front, _backend) = ChannelTransport::pair();
        let session = ClientSession::start(
            &registry,
            "s-2".to_string(),
            SessionMode::StreamableHttp,
            PoolKey::Direct("s-2".to_string()),
            front,
        );

        let waiter = session
            .request(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await
            .unwrap();
        assert!(waiter.is_none());
    }

    #[tokio::test]
    async fn test_backend_close_ends_session() {
        let registry = SessionRegistry::new();
        let (front, backend) = ChannelTransport::pair();
        let session = ClientSession::start(
            &registry,
            "s-3".to_string(),
            SessionMode::Sse,
            PoolKey::Direct("s-3".to_string()),
            front,
        );
        let mut stream = session.take_stream().unwrap();

        backend.send(json!({"jsonrpc": "2.0", "id": 1, "result": {}})).await.unwrap();
        backend.close().await;

        assert_eq!(stream.recv().await.unwrap()["id"], 1);
        assert!(stream.recv().await.is_none());
        assert!(registry.get("s-3").is_none());
    }

    #[tokio::test]
    async fn test_find_respects_scope_and_mode() {
        let registry = SessionRegistry::new();
        let (front, _backend) = ChannelTransport::pair();
        ClientSession::start(
            &registry,
            "s-4".to_string(),
            SessionMode::Sse,
            PoolKey::MetaMcp(MetaMcpKey::new("sk_one", "s-4")),
            front,
        );

        assert!(registry
            .find("s-4", SessionMode::Sse, SessionScope::Namespace("sk_one"))
            .is_some());
        assert!(registry
            .find("s-4", SessionMode::Sse, SessionScope::Namespace("sk_two"))
            .is_none());
        assert!(registry.find("s-4", SessionMode::Sse, SessionScope::Direct).is_none());
        assert!(registry
            .find("s-4", SessionMode::StreamableHttp, SessionScope::Namespace("sk_one"))
            .is_none());
    }

    fn state_with(connector: Arc<FakeConnector>) -> AppState {
        let repository: Arc<dyn ConfigRepository> = Arc::new(InMemoryConfigStore::new());
        let logs = ServerLogStore::default();
        let namespaces = Arc::new(InProcessAggregatorConnector::new(
            repository.clone(),
            connector.clone(),
            logs.clone(),
            Duration::from_secs(5),
        ));
        let config = Config {
            idle_rewarm: false,
            ..Config::default()
        };
        AppState::with_connectors(config, repository, connector, namespaces, logs)
    }

    fn stdio_request(name: &str) -> TransportRequest {
        TransportRequest {
            transport_type: "stdio".to_string(),
            server_name: name.to_string(),
            command: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_open_direct_session_retries_timeouts() {
        let connector = Arc::new(FakeConnector::default().timing_out(2));
        let state = state_with(connector.clone());

        let session = open_direct_session(&state, SessionMode::Sse, stdio_request("flaky"))
            .await
            .unwrap();

        assert_eq!(connector.connect_count(), 3);
        assert!(state.pool.get(&session.id).is_some());
        assert!(state.sessions.get(&session.id).is_some());
    }

    #[tokio::test]
    async fn test_open_direct_session_does_not_retry_setup_failures() {
        let connector = Arc::new(FakeConnector::default().failing("broken"));
        let state = state_with(connector.clone());

        let err = open_direct_session(&state, SessionMode::Sse, stdio_request("broken"))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, ApiError::BackendSetup(_)));
        assert_eq!(connector.connect_count(), 1);
        assert!(state.pool.is_empty());
        assert!(state.sessions.is_empty());
        assert!(state
            .logs
            .recent(None)
            .iter()
            .any(|event| event.server_name == "broken"));
    }

    #[test]
    fn test_connect_query_parsing() {
        let query: ConnectQuery = serde_json::from_value(json!({
            "transportType": "stdio",
            "command": "npx",
            "args": "-y @modelcontextprotocol/server-everything",
            "env": "{\"DEBUG\":\"1\"}"
        }))
        .unwrap();
        assert_eq!(query.transport_type.as_deref(), Some("stdio"));
        assert_eq!(query.args.as_deref(), Some("-y @modelcontextprotocol/server-everything"));
        assert!(query.server_uuid.is_none());
    }
}
