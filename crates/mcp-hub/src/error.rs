//! Error taxonomy.
//!
//! [`HubError`] covers everything the core (C1-C4) can fail with;
//! [`TransportError`] covers the HTTP-layer refusals C5 produces before a
//! request ever reaches the router. Both render into the wire shape their
//! caller needs rather than leaking internal detail — see
//! [`HubError::to_jsonrpc_error`] and [`HubError::to_tool_result`].

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};

use crate::models::BackendId;

/// Errors the core can produce while starting, stopping, or calling a
/// backend, or while registering its tools.
#[derive(thiserror::Error, Debug)]
pub enum HubError {
    #[error("backend '{backend}' is not configured")]
    UnknownBackend { backend: BackendId },

    #[error("backend '{backend}' is unavailable")]
    BackendUnavailable { backend: BackendId },

    #[error("backend '{backend}' failed to start: {message}")]
    StartFailed { backend: BackendId, message: String },

    #[error("backend '{backend}' exited while starting")]
    StartProcessExited { backend: BackendId },

    #[error("tool call to '{tool}' on backend '{backend}' timed out")]
    CallTimeout { backend: BackendId, tool: String },

    #[error("tool '{tool}' not found")]
    UnknownTool { tool: String },

    #[error("tool '{tool}' on backend '{backend}' rejected the call: {message}")]
    ToolCallFailed {
        backend: BackendId,
        tool: String,
        message: String,
    },

    #[error("backend '{backend}' crashed: {message}")]
    BackendCrashed { backend: BackendId, message: String },

    #[error(
        "tool name collision for '{tool}' between backends '{existing}' and '{incoming}'"
    )]
    ToolNameCollision {
        tool: String,
        existing: BackendId,
        incoming: BackendId,
    },

    #[error("transport for backend '{backend}' closed: {message}")]
    TransportClosed { backend: BackendId, message: String },

    #[error("malformed message from backend '{backend}': {message}")]
    ProtocolParseError { backend: BackendId, message: String },

    #[error("global concurrency limit exhausted")]
    ConcurrencyLimitExhausted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl HubError {
    /// Whether retrying the same call without operator intervention could
    /// plausibly succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CallTimeout { .. } | Self::BackendUnavailable { .. } | Self::ConcurrencyLimitExhausted
        )
    }

    /// JSON-RPC error code for this failure, per the taxonomy in
    /// `HubError::to_jsonrpc_error`'s callers.
    #[must_use]
    pub const fn jsonrpc_code(&self) -> i64 {
        match self {
            Self::UnknownBackend { .. } | Self::UnknownTool { .. } => -32601,
            Self::CallTimeout { .. } => -32000,
            Self::BackendUnavailable { .. }
            | Self::StartFailed { .. }
            | Self::StartProcessExited { .. }
            | Self::BackendCrashed { .. }
            | Self::TransportClosed { .. } => -32001,
            Self::ToolCallFailed { .. } => -32002,
            Self::ToolNameCollision { .. } => -32003,
            Self::ProtocolParseError { .. } => -32700,
            Self::ConcurrencyLimitExhausted => -32004,
            Self::Io(_) | Self::Serialization(_) => -32603,
        }
    }

    /// Render as a JSON-RPC 2.0 error object (`{"code", "message"}`), for
    /// failures that occur before or outside of a `tools/call` dispatch
    /// (e.g. an unknown method, a malformed backend frame).
    #[must_use]
    pub fn to_jsonrpc_error(&self) -> Value {
        json!({
            "code": self.jsonrpc_code(),
            "message": self.to_string(),
        })
    }

    /// Render as an MCP tool-result object with `isError: true`, for
    /// failures that occur while executing a specific `tools/call`. The
    /// caller still returns this inside a successful JSON-RPC response —
    /// tool failures are not transport failures.
    #[must_use]
    pub fn to_tool_result(&self) -> Value {
        json!({
            "content": [{ "type": "text", "text": self.to_string() }],
            "isError": true,
        })
    }

    /// How long a caller should wait before retrying, if this error is
    /// retryable at all.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ConcurrencyLimitExhausted => Some(Duration::from_millis(50)),
            _ => None,
        }
    }
}

/// HTTP-layer refusals produced by C5 before a request is handed to the
/// router: malformed envelopes, unacceptable `Accept`/`Content-Type`
/// headers, and method-not-allowed on the MCP endpoint.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("request body is not valid JSON-RPC: {0}")]
    BadRequest(String),

    #[error("Accept header must include application/json or text/event-stream")]
    NotAcceptable,

    #[error("Content-Type must be application/json")]
    UnsupportedMediaType,

    #[error("method not allowed on this endpoint")]
    MethodNotAllowed,

    #[error("unknown or expired session")]
    UnknownSession,
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::UnknownSession => StatusCode::NOT_FOUND,
        };
        let body = json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

pub type HubResult<T> = Result<T, HubError>;
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> BackendId {
        BackendId::new("files").unwrap()
    }

    #[test]
    fn timeout_is_retryable() {
        let err = HubError::CallTimeout {
            backend: backend(),
            tool: "read".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn collision_is_not_retryable() {
        let err = HubError::ToolNameCollision {
            tool: "read".to_string(),
            existing: backend(),
            incoming: backend(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn tool_result_marks_is_error() {
        let err = HubError::UnknownTool {
            tool: "missing".to_string(),
        };
        let result = err.to_tool_result();
        assert_eq!(result["isError"], true);
    }
}
