//! Application state

use std::sync::Arc;

use metamcp_shared::ConfigRepository;

use crate::config::{AggregatorMode, Config};
use crate::logs::ServerLogStore;
use crate::mcp::TransportResult;
use crate::metamcp::{InProcessAggregatorConnector, MetaMcpPool};
use crate::pool::{ConnectionPool, PoolSettings};
use crate::routes::session::SessionRegistry;
use crate::transport::{FactorySettings, NamespaceConnector, TransportConnector, TransportFactory};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Server, namespace and API key configuration
    pub repository: Arc<dyn ConfigRepository>,
    /// Direct backend connections keyed by client session
    pub pool: ConnectionPool,
    /// Aggregated namespace connections keyed by API key and session
    pub metamcp: MetaMcpPool,
    /// Live client sessions of the HTTP front end
    pub sessions: SessionRegistry,
    /// Per-server log events
    pub logs: ServerLogStore,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: Config,
        repository: Arc<dyn ConfigRepository>,
        logs: ServerLogStore,
    ) -> TransportResult<Self> {
        let factory = TransportFactory::new(FactorySettings::from_config(&config), logs.clone())?;
        let connector: Arc<dyn TransportConnector> = Arc::new(factory.clone());

        let namespaces: Arc<dyn NamespaceConnector> = match config.aggregator_mode {
            AggregatorMode::Process => Arc::new(factory),
            AggregatorMode::InProcess => Arc::new(InProcessAggregatorConnector::new(
                repository.clone(),
                connector.clone(),
                logs.clone(),
                config.request_timeout,
            )),
        };

        Ok(Self::with_connectors(config, repository, connector, namespaces, logs))
    }

    /// Build state around explicit backend connectors
    pub fn with_connectors(
        config: Config,
        repository: Arc<dyn ConfigRepository>,
        connector: Arc<dyn TransportConnector>,
        namespaces: Arc<dyn NamespaceConnector>,
        logs: ServerLogStore,
    ) -> Self {
        let pool = ConnectionPool::new(
            connector,
            PoolSettings {
                idle_timeout: config.session_idle_timeout,
                rewarm: config.idle_rewarm,
            },
        );
        let metamcp = MetaMcpPool::new(repository.clone(), namespaces, config.idle_rewarm);

        Self {
            config: Arc::new(config),
            repository,
            pool,
            metamcp,
            sessions: SessionRegistry::new(),
            logs,
        }
    }

    /// Close every client session and pool entry
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        self.metamcp.shutdown().await;
    }
}
