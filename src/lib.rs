//! mcp-broker: an on-host broker that multiplexes a pool of MCP servers
//! behind a single JSON-RPC 2.0 facade.
//!
//! This library can be embedded in other applications or driven through
//! the `mcp-broker` binary's CLI.

pub mod config;
pub mod daemon;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod metrics;
pub mod process;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use gateway::Gateway;
