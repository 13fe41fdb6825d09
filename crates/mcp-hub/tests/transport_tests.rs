//! Drives the C5 `axum` router in-process via `tower::ServiceExt::oneshot`,
//! with no backends configured — enough to exercise session issuance,
//! the notification fast path, `tools/list` on an empty registry, and
//! session teardown without spawning any real backend process.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use dashmap::DashMap;
use http_body_util::BodyExt;
use mcp_hub::config::{ConcurrencyConfig, TimeoutConfig};
use mcp_hub::registry::ToolRegistry;
use mcp_hub::router::HubRouter;
use mcp_hub::server::{create_router, session::SessionManager, HubState, StreamRegistry};
use serde_json::{json, Value};
use tower::ServiceExt;

fn empty_state() -> HubState {
    let registry = Arc::new(ToolRegistry::new());
    let backends = Arc::new(DashMap::new());
    let router = Arc::new(HubRouter::new(
        Arc::clone(&registry),
        backends,
        &ConcurrencyConfig::default(),
        TimeoutConfig::default(),
    ));
    HubState {
        router,
        registry,
        sessions: Arc::new(SessionManager::new()),
        streams: Arc::new(StreamRegistry::new()),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn initialize_assigns_a_session_and_returns_capabilities() {
    let app = create_router(empty_state());
    let body = json!({ "jsonrpc": "2.0", "method": "initialize", "id": 1 }).to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("mcp-session-id").is_some());
    let value = body_json(response).await;
    assert_eq!(value["result"]["protocolVersion"], "2025-06-18");
}

#[tokio::test]
async fn notifications_get_a_202_with_no_body() {
    let app = create_router(empty_state());
    let body = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }).to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn tools_list_on_empty_registry_is_an_empty_array() {
    let app = create_router(empty_state());
    let body = json!({ "jsonrpc": "2.0", "method": "tools/list", "id": 2 }).to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let value = body_json(response).await;
    assert_eq!(value["result"]["tools"], json!([]));
}

#[tokio::test]
async fn calling_an_unknown_tool_returns_a_jsonrpc_error() {
    let app = create_router(empty_state());
    let body = json!({
        "jsonrpc": "2.0",
        "method": "tools/call",
        "params": { "name": "missing" },
        "id": 3,
    })
    .to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let value = body_json(response).await;
    assert!(value.get("error").is_some());
}

#[tokio::test]
async fn malformed_body_is_rejected_with_bad_request() {
    let app = create_router(empty_state());
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from("not json"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn deleting_an_unknown_session_is_still_ok() {
    let app = create_router(empty_state());
    let request = Request::builder()
        .method("DELETE")
        .uri("/mcp")
        .header("mcp-session-id", "does-not-exist")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn batch_array_body_of_notifications_only_is_a_202() {
    let app = create_router(empty_state());
    let body = json!([
        { "jsonrpc": "2.0", "method": "notifications/initialized" },
        { "jsonrpc": "2.0", "method": "notifications/cancelled" }
    ])
    .to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn batch_array_mixing_a_request_and_a_notification_returns_one_response() {
    let app = create_router(empty_state());
    let body = json!([
        { "jsonrpc": "2.0", "method": "notifications/initialized" },
        { "jsonrpc": "2.0", "method": "tools/list", "id": 1 }
    ])
    .to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;
    assert_eq!(value, json!([{"jsonrpc": "2.0", "result": {"tools": []}, "id": 1}]));
}

#[tokio::test]
async fn wrong_content_type_is_unsupported_media_type() {
    let app = create_router(empty_state());
    let body = json!({ "jsonrpc": "2.0", "method": "ping", "id": 1 }).to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "text/plain")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn accept_header_rejecting_json_and_sse_is_not_acceptable() {
    let app = create_router(empty_state());
    let body = json!({ "jsonrpc": "2.0", "method": "ping", "id": 1 }).to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .header("accept", "text/plain")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
}

#[tokio::test]
async fn health_check_is_always_ok() {
    let app = create_router(empty_state());
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
