//! Client-facing streaming transport (C5): one `axum` router exposing the
//! MCP HTTP surface — `POST /mcp` for requests/notifications, `GET /mcp`
//! for the SSE stream, `DELETE /mcp` to end a session — plus `/health` and
//! `/ready`.
//!
//! Sessions live in [`SessionManager`]'s `RwLock<HashMap>`; the four
//! per-request stream maps spec.md §4.5 names live in [`super::stream::
//! StreamRegistry`], a second, narrower coarse lock — the spec's "a single
//! registry-owning task" permits either form, and this crate picks the
//! coarse-lock form for both (recorded in DESIGN.md) because every access
//! here is already `.await`-friendly and none of the critical sections do
//! meaningful work while held.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::registry::ToolRegistry;
use crate::router::HubRouter;

use super::session::{Session, SessionManager};
use super::stream::{StreamRegistry, REQUEST_DEADLINE};

const SESSION_HEADER: &str = "mcp-session-id";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const PROTOCOL_VERSION: &str = "2025-06-18";

#[derive(Clone)]
pub struct HubState {
    pub router: Arc<HubRouter>,
    pub registry: Arc<ToolRegistry>,
    pub sessions: Arc<SessionManager>,
    pub streams: Arc<StreamRegistry>,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    session_id: Option<String>,
}

pub fn create_router(state: HubState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/mcp", post(handle_mcp_post).get(handle_mcp_get).delete(handle_mcp_delete))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn readiness_check(State(state): State<HubState>) -> impl IntoResponse {
    Json(json!({ "status": "ready", "sessions": state.sessions.session_count().await }))
}

fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn with_session_header(mut response: axum::response::Response, session_id: &str) -> axum::response::Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

/// Whether `headers`' `Accept` includes `media` or a `*/*` wildcard.
/// A missing `Accept` header is treated as accepting anything.
fn accepts(headers: &HeaderMap, media: &str) -> bool {
    match headers.get(ACCEPT).and_then(|v| v.to_str().ok()) {
        None => true,
        Some(raw) => raw
            .split(',')
            .any(|part| part.trim().starts_with(media) || part.trim().starts_with("*/*")),
    }
}

/// Per spec.md §4.5: `Accept` must include `application/json` or
/// `text/event-stream`.
fn validate_accept(headers: &HeaderMap) -> Result<(), TransportError> {
    if accepts(headers, "application/json") || accepts(headers, "text/event-stream") {
        Ok(())
    } else {
        Err(TransportError::NotAcceptable)
    }
}

/// Per spec.md §4.5: `Content-Type` must be `application/json` (parameters
/// such as `; charset=utf-8` are ignored).
fn validate_content_type(headers: &HeaderMap) -> Result<(), TransportError> {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.split(';')
                .next()
                .unwrap_or("")
                .trim()
                .eq_ignore_ascii_case("application/json")
        })
        .unwrap_or(false);
    if is_json {
        Ok(())
    } else {
        Err(TransportError::UnsupportedMediaType)
    }
}

/// Parse a POST body as either a single JSON-RPC message or a batch array
/// of them, per spec.md §4.5 ("Body may be a single JSON-RPC message or an
/// array"). Returns the parsed messages plus whether the body was an array
/// to begin with, which governs whether the JSON-flow response is a single
/// object or an array.
fn parse_body(body: &[u8]) -> Result<(Vec<JsonRpcRequest>, bool), TransportError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| TransportError::BadRequest(e.to_string()))?;
    match value {
        Value::Array(items) => {
            let requests = items
                .into_iter()
                .map(|item| serde_json::from_value(item).map_err(|e| TransportError::BadRequest(e.to_string())))
                .collect::<Result<Vec<JsonRpcRequest>, _>>()?;
            Ok((requests, true))
        }
        other => {
            let request: JsonRpcRequest =
                serde_json::from_value(other).map_err(|e| TransportError::BadRequest(e.to_string()))?;
            Ok((vec![request], false))
        }
    }
}

/// A request is long-running iff it carries an explicit `progressToken`
/// or its method is `tools/call` — the hub keeps the source system's
/// hard-coded-method rule as a baseline and additionally always honors an
/// explicit token.
fn is_long_running(request: &JsonRpcRequest) -> bool {
    request.progress_token().is_some() || request.method == "tools/call"
}

async fn handle_mcp_post(
    State(state): State<HubState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<axum::response::Response, TransportError> {
    validate_accept(&headers)?;
    validate_content_type(&headers)?;
    let (messages, is_batch) = parse_body(&body)?;

    let session = state
        .sessions
        .get_or_create_session(session_id_from_headers(&headers).as_deref())
        .await;

    let requests: Vec<JsonRpcRequest> = messages.iter().filter(|m| !m.is_notification()).cloned().collect();

    if requests.is_empty() {
        for message in &messages {
            handle_notification(&state, &session, message).await;
        }
        let mut response = StatusCode::ACCEPTED.into_response();
        response = with_session_header(response, &session.id);
        return Ok(response);
    }

    for notification in messages.iter().filter(|m| m.is_notification()) {
        handle_notification(&state, &session, notification).await;
    }

    let wants_sse = accepts(&headers, "text/event-stream");
    if wants_sse && requests.iter().any(is_long_running) {
        let mut response = handle_sse_flow(&state, Arc::clone(&session), requests).await.into_response();
        response = with_session_header(response, &session.id);
        return Ok(response);
    }

    let responses = dispatch_json_flow(&state, &requests).await;
    let body = if is_batch {
        json!(responses)
    } else {
        serde_json::to_value(&responses[0]).unwrap_or(Value::Null)
    };

    let mut http_response = Json(body).into_response();
    http_response = with_session_header(http_response, &session.id);
    Ok(http_response)
}

/// Dispatch every request in a batch to completion and collect the
/// matching JSON-RPC responses, one per request, in order.
async fn dispatch_json_flow(state: &HubState, requests: &[JsonRpcRequest]) -> Vec<JsonRpcResponse> {
    let mut responses = Vec::with_capacity(requests.len());
    for request in requests {
        let result = dispatch_request(state, request).await;
        responses.push(match result {
            Ok(value) => JsonRpcResponse::success(request.id.clone(), value),
            Err(err) => JsonRpcResponse::error(request.id.clone(), err.jsonrpc_code(), err.to_string()),
        });
    }
    responses
}

fn extract_tool_name(request: &JsonRpcRequest) -> Option<String> {
    request.params.as_ref()?.get("name")?.as_str().map(str::to_string)
}

/// Run the SSE response flow for a batch carrying at least one long-running
/// request, per spec.md §4.5's six numbered steps: open a stream, bind
/// every request (and progress token) to it, dispatch everything
/// concurrently, enforce the per-batch deadline with a synthetic timeout
/// frame, and clean up the bindings once every request has settled.
async fn handle_sse_flow(
    state: &HubState,
    session: Arc<Session>,
    requests: Vec<JsonRpcRequest>,
) -> impl IntoResponse {
    let streams = Arc::clone(&state.streams);
    let (stream_id, receiver) = streams.open_stream().await;
    session.stream_ids.write().await.push(stream_id.clone());

    let mut relay_handles = Vec::new();
    for request in &requests {
        let id_key = request.id.clone().unwrap_or(Value::Null).to_string();
        let token = request.progress_token().cloned();
        streams.bind_request(&stream_id, &id_key, token.as_ref()).await;

        if let (Some(token), Some(tool_name)) = (token, extract_tool_name(request)) {
            if let Some(supervisor) = state.router.resolve_backend(&tool_name).await {
                relay_handles.push(spawn_stream_progress_relay(supervisor, Arc::clone(&streams), token));
            }
        }
    }

    let first_id = requests.first().and_then(|r| r.id.clone());
    spawn_sse_dispatch(state.clone(), Arc::clone(&streams), stream_id.clone(), requests, first_id, relay_handles);

    let sse_stream = ReceiverStream::new(receiver).map(|frame| Ok::<_, Infallible>(frame_to_event(&frame)));
    let sse = Sse::new(sse_stream).keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL).text(""));
    let mut response = sse.into_response();
    response.headers_mut().insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    response.headers_mut().insert("Cache-Control", HeaderValue::from_static("no-cache"));
    response
}

fn frame_to_event(frame: &Value) -> Event {
    let event_type = if frame.get("error").and_then(|e| e.get("code")) == Some(&json!(-32001)) {
        "error"
    } else if frame.get("method") == Some(&json!("notifications/progress")) {
        "progress"
    } else {
        "message"
    };
    Event::default().event(event_type).data(frame.to_string())
}

/// Dispatch every request in the batch concurrently, routing each result
/// to the stream through [`StreamRegistry::route_response`] as it
/// completes. Races the whole batch against [`REQUEST_DEADLINE`]: on
/// timeout, writes the synthetic `-32001` frame directly to the stream.
/// Either way, tears down the progress relays, forgets every request's
/// bindings, and closes the stream once done.
fn spawn_sse_dispatch(
    state: HubState,
    streams: Arc<StreamRegistry>,
    stream_id: String,
    requests: Vec<JsonRpcRequest>,
    first_id: Option<Value>,
    relay_handles: Vec<tokio::task::JoinHandle<()>>,
) {
    tokio::spawn(async move {
        let dispatch_all = async {
            let futures = requests.iter().map(|request| {
                let state = state.clone();
                let streams = Arc::clone(&streams);
                async move {
                    let result = dispatch_request(&state, request).await;
                    let response = match result {
                        Ok(value) => JsonRpcResponse::success(request.id.clone(), value),
                        Err(err) => JsonRpcResponse::error(request.id.clone(), err.jsonrpc_code(), err.to_string()),
                    };
                    let id_key = request.id.clone().unwrap_or(Value::Null).to_string();
                    let frame = serde_json::to_value(&response).unwrap_or(Value::Null);
                    streams.route_response(&id_key, frame).await;
                }
            });
            futures::future::join_all(futures).await;
        };

        tokio::select! {
            () = dispatch_all => {}
            () = tokio::time::sleep(REQUEST_DEADLINE) => {
                let frame = json!({
                    "jsonrpc": crate::jsonrpc::VERSION,
                    "id": first_id,
                    "error": { "code": -32001, "message": "Request timed out" },
                });
                streams.send_to_stream(&stream_id, frame).await;
            }
        }

        for handle in relay_handles {
            handle.abort();
        }
        for request in &requests {
            let id_key = request.id.clone().unwrap_or(Value::Null).to_string();
            streams.forget_request(&id_key, request.progress_token()).await;
        }
        streams.close_stream(&stream_id).await;
    });
}

/// Subscribe to one backend's progress events and forward the ones tagged
/// with `token` onto `token`'s stream, per spec.md §4.5's progress-
/// isolation rule. A progress notification tagged with a token no open
/// stream owns is never matched here — not an error, just a silent drop.
fn spawn_stream_progress_relay(
    supervisor: Arc<crate::supervisor::BackendSupervisor>,
    streams: Arc<StreamRegistry>,
    token: Value,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = supervisor.subscribe_events();
        while let Ok(event) = events.recv().await {
            if let crate::supervisor::SupervisorEvent::Progress { params, .. } = event {
                if params.get("progressToken") == Some(&token) {
                    let frame = json!({
                        "jsonrpc": crate::jsonrpc::VERSION,
                        "method": "notifications/progress",
                        "params": params,
                    });
                    streams.route_progress(&token, frame).await;
                }
            }
        }
    })
}

async fn handle_notification(state: &HubState, session: &Session, request: &JsonRpcRequest) {
    debug!(method = %request.method, session = %session.id, "notification received");
    match request.method.as_str() {
        "notifications/initialized" | "notifications/cancelled" => {}
        other => warn!(method = other, "unrecognized notification"),
    }
    let _ = &state.registry;
}

async fn dispatch_request(state: &HubState, request: &JsonRpcRequest) -> Result<Value, crate::error::HubError> {
    match request.method.as_str() {
        "initialize" => Ok(handle_initialize()),
        "ping" => Ok(json!({})),
        "tools/list" => {
            let tools = state.registry.list_public_tools().await;
            Ok(json!({ "tools": tools }))
        }
        "tools/call" => handle_tools_call(state, request).await,
        other => Err(crate::error::HubError::UnknownTool {
            tool: other.to_string(),
        }),
    }
}

fn handle_initialize() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": { "listChanged": true } },
        "serverInfo": { "name": "mcp-hub", "version": env!("CARGO_PKG_VERSION") },
    })
}

async fn handle_tools_call(state: &HubState, request: &JsonRpcRequest) -> Result<Value, crate::error::HubError> {
    let params = request.params.clone().unwrap_or_else(|| json!({}));
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| crate::error::HubError::UnknownTool {
            tool: String::new(),
        })?
        .to_string();
    let arguments = params.get("arguments").cloned();

    match state.router.call_tool(&name, arguments).await {
        Ok(result) => Ok(wrap_tool_result(result)),
        Err(err) if matches!(err, crate::error::HubError::ToolCallFailed { .. }) => Ok(err.to_tool_result()),
        Err(err) => Err(err),
    }
}

fn wrap_tool_result(result: Value) -> Value {
    if result.get("content").is_some() {
        return result;
    }
    json!({
        "content": [{ "type": "text", "text": result.to_string() }],
        "isError": false,
    })
}

async fn handle_mcp_get(
    State(state): State<HubState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<axum::response::Response, TransportError> {
    let session_id = session_id_from_headers(&headers).or(query.session_id);
    let session = match session_id {
        Some(id) => state.sessions.get_session(&id).await.ok_or(TransportError::UnknownSession)?,
        None => state.sessions.create_session().await,
    };

    let last_event_id: u64 = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let stream = build_sse_stream(session, last_event_id).await;
    let sse = Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL).text(""));
    let mut response = sse.into_response();
    response.headers_mut().insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    response.headers_mut().insert("Cache-Control", HeaderValue::from_static("no-cache"));
    Ok(response)
}

async fn build_sse_stream(
    session: Arc<Session>,
    last_event_id: u64,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let replay = session.events_after(last_event_id).await;
    let live = session.subscribe();

    let replay_stream = stream::iter(replay.into_iter().map(|e| Ok(e.to_sse_event())));
    let live_stream = tokio_stream::wrappers::BroadcastStream::new(live).filter_map(|item| async move {
        match item {
            Ok(event) => Some(Ok(event.to_sse_event())),
            Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(_)) => None,
        }
    });

    replay_stream.chain(live_stream)
}

/// Session termination is idempotent: deleting an unknown or already-gone
/// session is not an error, so this always returns `200 OK`.
async fn handle_mcp_delete(State(state): State<HubState>, headers: HeaderMap) -> StatusCode {
    if let Some(session_id) = session_id_from_headers(&headers) {
        let _ = state.sessions.remove_session(&session_id).await;
    }
    StatusCode::OK
}
