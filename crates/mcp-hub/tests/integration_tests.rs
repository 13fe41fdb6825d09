//! End-to-end scenarios driving a real [`mcp_hub::Hub`] (constructed from
//! configuration, same as `main.rs` would) through its HTTP surface via
//! `tower::ServiceExt::oneshot`, rather than hand-assembling individual
//! components the way `tests/transport_tests.rs` does.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use mcp_hub::config::HubConfig;
use mcp_hub::models::{BackendConfig, BackendId, BackendKind, BackendTimeouts, ProcessLaunch, StartMode};
use mcp_hub::server::{create_router, session::SessionManager, HubState, StreamRegistry};
use mcp_hub::Hub;
use serde_json::{json, Value};
use tower::ServiceExt;

fn lazy_backend(id: &str) -> BackendConfig {
    BackendConfig {
        id: BackendId::new(id).unwrap(),
        kind: BackendKind::Local(ProcessLaunch {
            command: "true".to_string(),
            args: vec![],
            cwd: None,
            env: HashMap::new(),
        }),
        start_mode: StartMode::Lazy,
        timeouts: BackendTimeouts::default(),
        tools_include: vec![],
        tools_exclude: vec![],
        concurrency: None,
    }
}

async fn app_for(hub: &Hub) -> axum::Router {
    let state = HubState {
        router: hub.router(),
        registry: hub.registry(),
        sessions: Arc::new(SessionManager::new()),
        streams: Arc::new(StreamRegistry::new()),
    };
    create_router(state)
}

async fn post_json(app: &axum::Router, body: Value) -> (StatusCode, Value, axum::http::HeaderMap) {
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value, headers)
}

#[tokio::test]
async fn scenario_full_lifecycle_initialize_then_list_tools() {
    let hub = Hub::new(HubConfig::default()).await.unwrap();
    let app = app_for(&hub).await;

    let (status, body, _) = post_json(&app, json!({"jsonrpc": "2.0", "method": "initialize", "id": 1})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["serverInfo"]["name"], "mcp-hub");

    let (status, body, _) = post_json(&app, json!({"jsonrpc": "2.0", "method": "tools/list", "id": 2})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["tools"], json!([]));
}

#[tokio::test]
async fn scenario_session_header_is_stable_across_requests() {
    let hub = Hub::new(HubConfig::default()).await.unwrap();
    let app = app_for(&hub).await;

    let (_, _, headers) = post_json(&app, json!({"jsonrpc": "2.0", "method": "initialize", "id": 1})).await;
    let session_id = headers.get("mcp-session-id").unwrap().to_str().unwrap().to_string();

    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .header("mcp-session-id", session_id.clone())
        .body(Body::from(json!({"jsonrpc": "2.0", "method": "ping", "id": 2}).to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let returned = response.headers().get("mcp-session-id").unwrap().to_str().unwrap();
    assert_eq!(returned, session_id);
}

#[tokio::test]
async fn scenario_deleting_a_session_makes_it_unknown_afterward() {
    let hub = Hub::new(HubConfig::default()).await.unwrap();
    let app = app_for(&hub).await;

    let (_, _, headers) = post_json(&app, json!({"jsonrpc": "2.0", "method": "initialize", "id": 1})).await;
    let session_id = headers.get("mcp-session-id").unwrap().to_str().unwrap().to_string();

    let delete_request = Request::builder()
        .method("DELETE")
        .uri("/mcp")
        .header("mcp-session-id", session_id.clone())
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(delete_request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let get_request = Request::builder()
        .method("GET")
        .uri("/mcp")
        .header("mcp-session-id", session_id)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(get_request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn scenario_malformed_envelope_never_reaches_the_router() {
    let hub = Hub::new(HubConfig::default()).await.unwrap();
    let app = app_for(&hub).await;

    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from("{ this is not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn scenario_two_lazy_backends_are_configured_but_neither_starts_eagerly() {
    let config = HubConfig {
        backends: vec![lazy_backend("a"), lazy_backend("b")],
        ..HubConfig::default()
    };
    let hub = Hub::new(config).await.unwrap();
    // Construction must not have started either lazy backend, so the
    // registry is empty until the first call to one of their tools.
    assert_eq!(hub.registry().list_public_tools().await.len(), 0);
}

#[tokio::test]
async fn scenario_concurrent_calls_to_an_unknown_tool_fail_independently() {
    let hub = Hub::new(HubConfig::default()).await.unwrap();
    let app = app_for(&hub).await;

    let calls = (0..8).map(|i| {
        let app = app.clone();
        tokio::spawn(async move {
            let body = json!({
                "jsonrpc": "2.0",
                "method": "tools/call",
                "params": { "name": format!("missing-{i}") },
                "id": i,
            });
            post_json(&app, body).await
        })
    });

    for handle in calls {
        let (status, body, _) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("error").is_some());
    }
}
