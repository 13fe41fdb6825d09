//! Shared data types: backend identity/config/state and tool descriptors.
//!
//! Session and stream-context types live in [`crate::server::session`]
//! instead, since they are owned exclusively by the transport task and
//! have no meaning outside it.

mod backend;
mod tool;

pub use backend::{
    BackendConfig, BackendIdError, BackendKind, BackendState, BackendTimeouts, BackendId,
    ProcessLaunch, RemoteAuth, RemoteEndpoint, RemoteTransportKind, StartMode,
};
pub use tool::{
    derive_public_name, BackendTool, McpToolInfo, NameResolution, NamingStrategy, RegisteredTool,
};
