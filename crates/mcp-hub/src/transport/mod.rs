//! Backend transport (C1): one concrete connection type per
//! [`crate::models::BackendKind`]/[`crate::models::RemoteTransportKind`].
//!
//! Every variant implements [`BackendTransport`] so the supervisor (C2)
//! never branches on transport kind itself.

mod http;
mod pipe;
mod sse;
mod websocket;

pub use http::HttpTransport;
pub use pipe::PipeTransport;
pub use sse::SseTransport;
pub use websocket::WebSocketTransport;

use async_trait::async_trait;

use crate::jsonrpc::{JsonRpcMessage, JsonRpcRequest};

/// A failure a transport can report, distinct from [`crate::error::HubError`]
/// because the supervisor translates each variant into specific state
/// transitions (e.g. `ProcessExit` always means `Crashed`).
#[derive(thiserror::Error, Debug)]
pub enum TransportFailure {
    #[error("failed to spawn backend process: {0}")]
    SpawnFailed(String),

    #[error("backend process exited (code={code:?}, signal={signal:?})")]
    ProcessExit {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("attempted to write after the transport was closed")]
    WriteAfterClose,

    #[error("malformed message from backend: {0}")]
    ProtocolParseError(String),

    #[error("transport closed: {0}")]
    TransportClosed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A connection to one backend. Each call transmits or receives exactly
/// one JSON-RPC frame; framing (newline-delimited, SSE `data:` lines, or
/// WebSocket text frames) is the transport's concern, not the caller's.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// Establish the connection: spawn the process, or open the socket.
    /// Idempotent is not required — the supervisor calls this exactly once
    /// per `start()`.
    async fn open(&mut self) -> Result<(), TransportFailure>;

    /// Send one request or notification.
    async fn send(&mut self, request: &JsonRpcRequest) -> Result<(), TransportFailure>;

    /// Receive the next frame. Returns `Ok(None)` on a clean EOF/close,
    /// distinct from an error — callers treat `None` as "the backend is
    /// done for now", not necessarily a crash.
    async fn recv(&mut self) -> Result<Option<JsonRpcMessage>, TransportFailure>;

    /// Tear the connection down. Safe to call more than once.
    async fn close(&mut self) -> Result<(), TransportFailure>;

    /// Whether this connection's stderr has shown a package-install
    /// pattern since `open`. Only [`PipeTransport`] has a stderr to scan;
    /// every other variant keeps the default `false`.
    fn saw_install_pattern(&self) -> bool {
        false
    }
}
