//! `remote` backend transport over a WebSocket: every JSON-RPC frame is
//! one text message, in either direction.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::jsonrpc::{JsonRpcMessage, JsonRpcRequest};
use crate::models::{RemoteAuth, RemoteEndpoint};

use super::{BackendTransport, TransportFailure};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct WebSocketTransport {
    endpoint: RemoteEndpoint,
    socket: Option<Socket>,
}

impl WebSocketTransport {
    #[must_use]
    pub const fn new(endpoint: RemoteEndpoint) -> Self {
        Self {
            endpoint,
            socket: None,
        }
    }
}

#[async_trait]
impl BackendTransport for WebSocketTransport {
    async fn open(&mut self) -> Result<(), TransportFailure> {
        let mut request = self
            .endpoint
            .url
            .clone()
            .into_client_request()
            .map_err(|e| TransportFailure::SpawnFailed(e.to_string()))?;

        if let Some(auth) = &self.endpoint.auth {
            let value = match auth {
                RemoteAuth::Bearer { token } => format!("Bearer {token}"),
                RemoteAuth::Basic { username, password } => {
                    format!("Basic {}", BASE64.encode(format!("{username}:{password}")))
                }
            };
            let header_value = value
                .parse()
                .map_err(|_| TransportFailure::SpawnFailed("invalid auth header".to_string()))?;
            request.headers_mut().insert("Authorization", header_value);
        }

        let (socket, _response) = connect_async(request)
            .await
            .map_err(|e| TransportFailure::SpawnFailed(e.to_string()))?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn send(&mut self, request: &JsonRpcRequest) -> Result<(), TransportFailure> {
        let socket = self.socket.as_mut().ok_or(TransportFailure::WriteAfterClose)?;
        let text = serde_json::to_string(request)
            .map_err(|e| TransportFailure::ProtocolParseError(e.to_string()))?;
        socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportFailure::TransportClosed(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<JsonRpcMessage>, TransportFailure> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(None);
        };
        loop {
            let Some(frame) = socket.next().await else {
                return Ok(None);
            };
            let frame = frame.map_err(|e| TransportFailure::TransportClosed(e.to_string()))?;
            match frame {
                Message::Text(text) => {
                    return JsonRpcMessage::parse_line(&text)
                        .map(Some)
                        .map_err(|e| TransportFailure::ProtocolParseError(e.to_string()));
                }
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {
                    continue;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportFailure> {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
        Ok(())
    }
}
