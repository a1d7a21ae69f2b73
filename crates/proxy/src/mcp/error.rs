//! Transport error taxonomy

use std::time::Duration;

/// Error type for transport construction and message delivery
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Unrecognized transport selector. Never retried.
    #[error("Invalid transport type: {0}")]
    InvalidTransportType(String),

    /// The transport could not be started (spawn failure, connect refused, bad status)
    #[error("Connection setup failed: {0}")]
    ConnectionSetup(String),

    /// Backend answered 401; the caller is expected to run an out-of-band
    /// authorization flow and retry
    #[error("Backend requires authorization: {0}")]
    Unauthorized(String),

    #[error("Timed out after {after:?} while {operation}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// One aggregation member could not be reached
    #[error("Backend {server} unavailable: {reason}")]
    BackendUnavailable { server: String, reason: String },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(#[from] ShellSplitError),

    /// Backend answered a message with a non-success HTTP status
    #[error("{url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Transport closed")]
    Closed,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Returns true if the caller may retry the operation with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout { .. } => true,

            TransportError::InvalidTransportType(_) => false,
            TransportError::ConnectionSetup(_) => false,
            TransportError::Unauthorized(_) => false,
            TransportError::BackendUnavailable { .. } => false,
            TransportError::InvalidArguments(_) => false,
            TransportError::HttpStatus { .. } => false,
            TransportError::Closed => false,
            TransportError::Http(_) => false,
            TransportError::Json(_) => false,
            TransportError::Io(_) => false,
        }
    }

    /// True for every failure that means "the transport did not come up"
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionSetup(_) | TransportError::Unauthorized(_)
        )
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Failure while splitting a shell-style argument string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShellSplitError {
    #[error("unterminated {0} quote")]
    UnterminatedQuote(char),

    #[error("trailing backslash")]
    TrailingBackslash,
}

/// Failure while draining a backend process's stderr. Logged, never propagated.
#[derive(Debug, thiserror::Error)]
#[error("stderr stream of '{command}' failed: {source}")]
pub struct StderrStreamError {
    pub command: String,
    #[source]
    pub source: std::io::Error,
}
