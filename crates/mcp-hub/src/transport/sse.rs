//! `remote` backend transport over Server-Sent Events: requests go out as
//! individual POSTs, responses and server-initiated notifications arrive
//! on a long-lived `text/event-stream` GET.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;

use crate::jsonrpc::{JsonRpcMessage, JsonRpcRequest};
use crate::models::{RemoteAuth, RemoteEndpoint};

use super::{BackendTransport, TransportFailure};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct SseTransport {
    endpoint: RemoteEndpoint,
    client: Option<Client>,
    /// Buffered frames parsed out of the event stream but not yet consumed.
    buffer: VecDeque<JsonRpcMessage>,
    /// Leftover partial line across `recv` polls of the byte stream.
    carry: String,
    stream: Option<reqwest::Response>,
}

impl SseTransport {
    #[must_use]
    pub const fn new(endpoint: RemoteEndpoint) -> Self {
        Self {
            endpoint,
            client: None,
            buffer: VecDeque::new(),
            carry: String::new(),
            stream: None,
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

    /// Parse accumulated bytes for complete `data: ...` lines, skipping
    /// blank lines and `:`-prefixed heartbeat comments per the SSE spec.
    fn drain_complete_lines(&mut self) {
        while let Some(pos) = self.carry.find('\n') {
            let line = self.carry[..pos].trim_end_matches('\r').to_string();
            self.carry.drain(..=pos);
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim_start();
            match JsonRpcMessage::parse_line(payload) {
                Ok(message) => self.buffer.push_back(message),
                Err(_) => continue,
            }
        }
    }
}

#[async_trait]
impl BackendTransport for SseTransport {
    async fn open(&mut self) -> Result<(), TransportFailure> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportFailure::SpawnFailed(e.to_string()))?;

        let response = self
            .apply_auth(client.get(&self.endpoint.url).header("Accept", "text/event-stream"))
            .send()
            .await
            .map_err(|e| TransportFailure::SpawnFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportFailure::SpawnFailed(format!(
                "backend stream returned HTTP {}",
                response.status()
            )));
        }

        self.stream = Some(response);
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
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<JsonRpcMessage>, TransportFailure> {
        if let Some(message) = self.buffer.pop_front() {
            return Ok(Some(message));
        }

        let Some(response) = self.stream.as_mut() else {
            return Ok(None);
        };

        loop {
            let Some(chunk) = response.chunk().await.map_err(|e| TransportFailure::TransportClosed(e.to_string()))? else {
                return Ok(None);
            };
            self.carry.push_str(&String::from_utf8_lossy(&chunk));
            self.drain_complete_lines();
            if let Some(message) = self.buffer.pop_front() {
                return Ok(Some(message));
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportFailure> {
        self.stream = None;
        self.client = None;
        self.buffer.clear();
        self.carry.clear();
        Ok(())
    }
}
