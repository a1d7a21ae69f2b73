//! MetaMCP proxy server
//!
//! `serve` (the default) runs the HTTP front end. `aggregate` serves one
//! namespace over stdin/stdout and is spawned by `serve` for namespace
//! sessions.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use metamcp_proxy::{
    config::{Config, ConfigError},
    logs::ServerLogStore,
    metamcp::{serve_transport, NamespaceAggregator},
    pool::REAP_INTERVAL,
    routes::create_router,
    state::AppState,
    transport::{stdio::ProcessStdioTransport, FactorySettings, TransportFactory},
};
use metamcp_shared::{ConfigDocument, ConfigRepository, InMemoryConfigStore, NamespaceSnapshot};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "metamcp_proxy=info,tower_http=info";

#[derive(Parser)]
#[command(name = "metamcp-proxy", version, about = "MCP transport proxy and namespace aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP/SSE proxy
    Serve,
    /// Serve the namespace bound to METAMCP_API_KEY over stdio
    Aggregate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            init_tracing(false);
            serve().await
        }
        Command::Aggregate => {
            // stdout carries the protocol
            init_tracing(true);
            aggregate().await
        }
    }
}

fn init_tracing(stderr_only: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    match (json, stderr_only) {
        (true, true) => builder.json().with_writer(std::io::stderr).init(),
        (true, false) => builder.json().init(),
        (false, true) => builder.with_ansi(false).with_writer(std::io::stderr).init(),
        (false, false) => builder.init(),
    }
}

async fn serve() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let store = match &config.config_path {
        Some(path) => {
            let document = ConfigDocument::from_file(path)
                .with_context(|| format!("reading {}", path.display()))?;
            InMemoryConfigStore::from_document(document)?
        }
        None => InMemoryConfigStore::new(),
    };
    let repository: Arc<dyn ConfigRepository> = Arc::new(store);

    let state = AppState::new(config.clone(), repository.clone(), ServerLogStore::default())?;

    if config.idle_rewarm {
        for server in repository.servers().await {
            if server.is_active() {
                let pool = state.pool.clone();
                tokio::spawn(async move {
                    pool.warm_idle_session(server).await;
                });
            }
        }
    }
    let reaper = state.pool.spawn_reaper(REAP_INTERVAL);

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("binding {}", config.bind_address))?;
    tracing::info!(
        address = %config.bind_address,
        aggregator_mode = ?config.aggregator_mode,
        "MetaMCP proxy listening"
    );

    // Closing the pools ends every open client stream, which lets the
    // server finish draining
    let draining = state.clone();
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutting down");
            draining.shutdown().await;
        })
        .await?;

    reaper.abort();
    Ok(())
}

async fn aggregate() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let api_key = std::env::var("METAMCP_API_KEY").map_err(|_| ConfigError::Missing("METAMCP_API_KEY"))?;
    let base_url = std::env::var("METAMCP_BASE_URL").unwrap_or_else(|_| config.public_url.clone());

    let url = format!("{}/api/namespaces/current", base_url.trim_end_matches('/'));
    let snapshot: NamespaceSnapshot = reqwest::Client::new()
        .get(&url)
        .bearer_auth(&api_key)
        .timeout(config.connect_timeout)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
        .context("decoding namespace snapshot")?;

    let logs = ServerLogStore::default();
    let factory = TransportFactory::new(FactorySettings::from_config(&config), logs.clone())?;
    let aggregator = Arc::new(NamespaceAggregator::new(
        snapshot,
        Arc::new(factory),
        logs,
        config.request_timeout,
    ));

    serve_transport(aggregator, Arc::new(ProcessStdioTransport::new())).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
