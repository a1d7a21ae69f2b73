//! MCP (Model Context Protocol) building blocks
//!
//! JSON-RPC envelopes, the transport error taxonomy, SSE framing, backend
//! request correlation and the naming rules the aggregator routes by.
//!
//! # Namespacing
//!
//! Tools and prompts of aggregated servers are exposed as
//! `{server_name}__{name}` so members never collide.

pub mod client;
pub mod error;
pub mod router;
pub mod streaming;
pub mod types;

pub use client::{BackendNotification, McpClient, NotificationSink};
pub use error::{ShellSplitError, StderrStreamError, TransportError, TransportResult};
pub use router::McpMethod;
pub use types::*;
