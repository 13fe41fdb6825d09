//! `remote` backend transport over plain request/response HTTP: each call
//! is one POST carrying a JSON-RPC request, answered by one JSON-RPC
//! response in the body.

use async_trait::async_trait;
use reqwest::Client;
use std::collections::VecDeque;
use std::time::Duration;

use crate::jsonrpc::{JsonRpcMessage, JsonRpcRequest};
use crate::models::{RemoteAuth, RemoteEndpoint};

use super::{BackendTransport, TransportFailure};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpTransport {
    endpoint: RemoteEndpoint,
    client: Option<Client>,
    /// Responses received but not yet consumed by `recv`. Plain HTTP is
    /// one-response-per-send, so this never holds more than one entry, but
    /// keeping a queue keeps the type identical in shape to the streaming
    /// transports.
    pending: VecDeque<JsonRpcMessage>,
}

impl HttpTransport {
    #[must_use]
    pub const fn new(endpoint: RemoteEndpoint) -> Self {
        Self {
            endpoint,
            client: None,
            pending: VecDeque::new(),
        }
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.endpoint.auth {
            Some(RemoteAuth::Bearer { token }) => builder.bearer_auth(token),
            Some(RemoteAuth::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
            None => builder,
        }
    }
}

#[async_trait]
impl BackendTransport for HttpTransport {
    async fn open(&mut self) -> Result<(), TransportFailure> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportFailure::SpawnFailed(e.to_string()))?;
        self.client = Some(client);
        Ok(())
    }

    async fn send(&mut self, request: &JsonRpcRequest) -> Result<(), TransportFailure> {
        let client = self.client.as_ref().ok_or(TransportFailure::WriteAfterClose)?;
        let response = self
            .apply_auth(client.post(&self.endpoint.url).json(request))
            .send()
            .await
            .map_err(|e| TransportFailure::TransportClosed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportFailure::TransportClosed(format!(
                "backend returned HTTP {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TransportFailure::ProtocolParseError(e.to_string()))?;
        let message = serde_json::from_value(body)
            .map(JsonRpcMessage::Response)
            .map_err(|e| TransportFailure::ProtocolParseError(e.to_string()))?;
        self.pending.push_back(message);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<JsonRpcMessage>, TransportFailure> {
        Ok(self.pending.pop_front())
    }

    async fn close(&mut self) -> Result<(), TransportFailure> {
        self.client = None;
        self.pending.clear();
        Ok(())
    }
}
