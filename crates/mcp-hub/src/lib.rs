//! Aggregating hub for the Model Context Protocol.
//!
//! Discovers tools across many backends — local child processes, package
//! runners, and remote HTTP/SSE/WebSocket endpoints — resolves name
//! collisions, multiplexes calls, relays streaming progress, and
//! supervises backend lifecycles, all behind one MCP endpoint.
//!
//! ```no_run
//! use mcp_hub::{config::HubConfig, Hub};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = HubConfig::from_file("hub.toml")?;
//! let hub = Hub::new(config).await?;
//! hub.serve().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
mod hub;
pub mod jsonrpc;
pub mod models;
pub mod registry;
pub mod router;
pub mod server;
pub mod supervisor;
pub mod transport;

pub use config::HubConfig;
pub use error::{HubError, TransportError};
pub use hub::Hub;
