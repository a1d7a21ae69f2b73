//! MetaMCP Proxy Library
//!
//! Transport factory, connection pools, namespace aggregation and the
//! HTTP/SSE front end of the MetaMCP proxy.

pub mod config;
pub mod error;
pub mod logs;
pub mod mcp;
pub mod metamcp;
pub mod pool;
pub mod routes;
pub mod state;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use logs::ServerLogStore;
pub use metamcp::MetaMcpPool;
pub use pool::ConnectionPool;
pub use state::AppState;
pub use transport::TransportFactory;
