//! MetaMCP Shared Types and Utilities
//!
//! This crate contains the configuration model and storage seam shared by the
//! proxy and its aggregator subprocess.

pub mod error;
pub mod store;
pub mod types;

pub use error::*;
pub use store::{ConfigDocument, ConfigRepository, InMemoryConfigStore};
pub use types::*;
