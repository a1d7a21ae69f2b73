//! Application configuration

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How aggregated namespace servers are run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorMode {
    /// Child process running the `aggregate` subcommand
    Process,
    /// Task inside the proxy, wired up with in-memory channels
    InProcess,
}

impl FromStr for AggregatorMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(AggregatorMode::Process),
            "in_process" | "in-process" => Ok(AggregatorMode::InProcess),
            other => Err(ConfigError::Invalid(
                "METAMCP_AGGREGATOR_MODE",
                format!("expected 'process' or 'in_process', got '{}'", other),
            )),
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub public_url: String,

    // Containerized host
    pub transform_localhost_to_docker_internal: bool,
    pub docker_host_alias: String,

    // Spawned processes
    pub default_env: BTreeMap<String, String>,
    pub spawn_timeout: Duration,
    pub close_grace: Duration,

    // Network transports
    pub connect_timeout: Duration,
    pub request_timeout: Duration,

    // Pools
    pub session_idle_timeout: Duration,
    pub idle_rewarm: bool,

    // Namespaces
    pub config_path: Option<PathBuf>,
    pub aggregator_mode: AggregatorMode,
    pub aggregator_command: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:12009".to_string()),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:12009".to_string()),

            // Containerized host
            transform_localhost_to_docker_internal: env::var(
                "TRANSFORM_LOCALHOST_TO_DOCKER_INTERNAL",
            )
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false),
            docker_host_alias: env::var("DOCKER_HOST_ALIAS")
                .unwrap_or_else(|_| "host.docker.internal".to_string()),

            // Spawned processes
            default_env: match env::var("MCP_DEFAULT_ENV") {
                Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                    .map_err(|e| ConfigError::Invalid("MCP_DEFAULT_ENV", e.to_string()))?,
                _ => BTreeMap::new(),
            },
            spawn_timeout: Duration::from_millis(
                env::var("MCP_SPAWN_TIMEOUT_MS")
                    .unwrap_or_else(|_| "10000".to_string())
                    .parse()
                    .unwrap_or(10000),
            ),
            close_grace: Duration::from_millis(
                env::var("MCP_CLOSE_GRACE_MS")
                    .unwrap_or_else(|_| "2000".to_string())
                    .parse()
                    .unwrap_or(2000),
            ),

            // Network transports
            connect_timeout: Duration::from_millis(
                env::var("MCP_CONNECT_TIMEOUT_MS")
                    .unwrap_or_else(|_| "10000".to_string())
                    .parse()
                    .unwrap_or(10000),
            ),
            request_timeout: Duration::from_millis(
                env::var("MCP_REQUEST_TIMEOUT_MS")
                    .unwrap_or_else(|_| "30000".to_string())
                    .parse()
                    .unwrap_or(30000),
            ),

            // Pools
            session_idle_timeout: Duration::from_secs(
                env::var("MCP_SESSION_IDLE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "1800".to_string()) // 30 minutes
                    .parse()
                    .unwrap_or(1800),
            ),
            idle_rewarm: env::var("MCP_IDLE_REWARM")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),

            // Namespaces
            config_path: env::var("METAMCP_CONFIG_PATH").ok().map(PathBuf::from),
            aggregator_mode: env::var("METAMCP_AGGREGATOR_MODE")
                .unwrap_or_else(|_| "process".to_string())
                .parse()?,
            aggregator_command: env::var("METAMCP_AGGREGATOR_COMMAND")
                .ok()
                .filter(|command| !command.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:12009".to_string(),
            public_url: "http://localhost:12009".to_string(),
            transform_localhost_to_docker_internal: false,
            docker_host_alias: "host.docker.internal".to_string(),
            default_env: BTreeMap::new(),
            spawn_timeout: Duration::from_millis(10000),
            close_grace: Duration::from_millis(2000),
            connect_timeout: Duration::from_millis(10000),
            request_timeout: Duration::from_millis(30000),
            session_idle_timeout: Duration::from_secs(1800),
            idle_rewarm: true,
            config_path: None,
            aggregator_mode: AggregatorMode::Process,
            aggregator_command: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
