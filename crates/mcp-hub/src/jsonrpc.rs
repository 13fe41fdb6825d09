//! Line-delimited JSON-RPC 2.0 wire types shared by the backend transport
//! (C1) and the client-facing transport (C5).

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const VERSION: &str = "2.0";

/// A request or notification read from a backend or a client. Notifications
/// are requests with `id` absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    #[must_use]
    pub const fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// The `params._meta.progressToken` field, if present, used to route
    /// streaming progress notifications back to the originating stream.
    #[must_use]
    pub fn progress_token(&self) -> Option<&Value> {
        self.params.as_ref()?.get("_meta")?.get("progressToken")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

impl JsonRpcResponse {
    #[must_use]
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(VERSION),
            result: Some(result),
            error: None,
            id,
        }
    }

    #[must_use]
    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(VERSION),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }
}

/// A notification pushed by the hub without any corresponding request
/// (e.g. `notifications/progress`), never carrying an `id`.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(VERSION),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// One parsed frame off a backend transport: a request/notification sent
/// *by* the backend (rare — backends are typically pure responders), or a
/// response to a call the hub made.
#[derive(Debug, Clone)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Parse one line of a line-delimited JSON-RPC stream. A line carrying
    /// both `method` and no `result`/`error` fields is a request or
    /// notification; otherwise it is a response.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`serde_json::Error`] on malformed JSON.
    pub fn parse_line(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        if value.get("method").is_some() {
            Ok(Self::Request(serde_json::from_value(value)?))
        } else {
            Ok(Self::Response(serde_json::from_value(value)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_has_no_id() {
        let req = JsonRpcRequest {
            jsonrpc: Cow::Borrowed(VERSION),
            method: "notifications/initialized".to_string(),
            params: None,
            id: None,
        };
        assert!(req.is_notification());
    }

    #[test]
    fn progress_token_extracted_from_meta() {
        let req = JsonRpcRequest {
            jsonrpc: Cow::Borrowed(VERSION),
            method: "tools/call".to_string(),
            params: Some(json!({ "_meta": { "progressToken": "abc" } })),
            id: Some(json!(1)),
        };
        assert_eq!(req.progress_token(), Some(&json!("abc")));
    }

    #[test]
    fn parse_line_distinguishes_request_from_response() {
        let req = JsonRpcMessage::parse_line(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#).unwrap();
        assert!(matches!(req, JsonRpcMessage::Request(_)));

        let resp = JsonRpcMessage::parse_line(r#"{"jsonrpc":"2.0","result":{},"id":1}"#).unwrap();
        assert!(matches!(resp, JsonRpcMessage::Response(_)));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(JsonRpcMessage::parse_line("not json").is_err());
    }
}
