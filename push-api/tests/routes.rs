use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use push_api::auth::generate_token;
use push_api::{router, ApiState};
use push_core::config::DispatchConfig;
use push_core::{FailurePolicy, MemoryTokenStore};
use push_delivery::{Dispatcher, GatewayRouter, LogGateway};
use push_registry::TokenRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const SECRET: &str = "test-secret";

fn app() -> Router {
    let store = Arc::new(MemoryTokenStore::new());
    let registry = Arc::new(TokenRegistry::local(store, FailurePolicy::default()));
    let gateways = Arc::new(GatewayRouter::new(Arc::new(LogGateway::new())));
    let dispatcher = Dispatcher::new(registry, gateways, DispatchConfig::default());
    router(ApiState::new(dispatcher, SECRET))
}

fn bearer(user_id: i64) -> String {
    format!("Bearer {}", generate_token(user_id, SECRET, 1).unwrap())
}

async fn call(app: &Router, method: Method, uri: &str, user: Option<i64>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user_id) = user {
        builder = builder.header(header::AUTHORIZATION, bearer(user_id));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_needs_no_auth() {
    let app = app();
    let (status, body) = call(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn api_routes_require_a_valid_token() {
    let app = app();
    let (status, _) = call(&app, Method::GET, "/api/v1/device-tokens", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/api/v1/device-tokens")
        .header(header::AUTHORIZATION, "Bearer not-a-jwt")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn register_list_and_unregister() {
    let app = app();
    let (status, record) = call(
        &app,
        Method::POST,
        "/api/v1/device-tokens",
        Some(1),
        Some(json!({"token": "tokA", "platform": "android", "device_info": {"model": "Pixel"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["user_id"], 1);
    assert_eq!(record["is_active"], true);
    assert_eq!(record["platform"], "android");

    let (_, list) = call(&app, Method::GET, "/api/v1/device-tokens", Some(1), None).await;
    assert_eq!(list["tokens"].as_array().unwrap().len(), 1);

    let (status, body) = call(&app, Method::DELETE, "/api/v1/device-tokens/tokA", Some(2), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "OWNERSHIP_ERROR");

    let (status, _) = call(&app, Method::DELETE, "/api/v1/device-tokens/tokA", Some(1), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = call(&app, Method::DELETE, "/api/v1/device-tokens/tokA", Some(1), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn register_rejects_unknown_platform() {
    let app = app();
    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/device-tokens",
        Some(1),
        Some(json!({"token": "tokA", "platform": "symbian"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn stats_count_by_platform() {
    let app = app();
    for (user, token, platform) in [(1, "tok-1", "android"), (2, "tok-2", "ios"), (3, "tok-3", "ios")] {
        call(
            &app,
            Method::POST,
            "/api/v1/device-tokens",
            Some(user),
            Some(json!({"token": token, "platform": platform})),
        )
        .await;
    }

    let (status, stats) = call(&app, Method::GET, "/api/v1/stats/device-tokens", Some(1), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total"], 3);
    assert_eq!(stats["active"], 3);
    assert_eq!(stats["by_platform"]["ios"]["active"], 2);
    assert_eq!(stats["by_platform"]["web"]["active"], 0);
}

#[tokio::test]
async fn token_named_like_a_route_can_be_unregistered() {
    let app = app();
    let (status, _) = call(
        &app,
        Method::POST,
        "/api/v1/device-tokens",
        Some(1),
        Some(json!({"token": "stats", "platform": "web"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(&app, Method::DELETE, "/api/v1/device-tokens/stats", Some(1), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, list) = call(&app, Method::GET, "/api/v1/device-tokens", Some(1), None).await;
    assert!(list["tokens"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn push_routes_dispatch() {
    let app = app();
    call(
        &app,
        Method::POST,
        "/api/v1/device-tokens",
        Some(1),
        Some(json!({"token": "tokA", "platform": "android"})),
    )
    .await;

    let (status, result) = call(
        &app,
        Method::POST,
        "/api/v1/push/device",
        Some(1),
        Some(json!({"token": "tokA", "title": "Hi", "data": {"screen": "inbox", "n": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["success"], true);
    assert_eq!(result["target"], "tokA");

    let (status, batch) = call(
        &app,
        Method::POST,
        "/api/v1/push/user",
        Some(1),
        Some(json!({"user_id": 1, "title": "Hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(batch["total_sent"], 1);

    let (status, multi) = call(
        &app,
        Method::POST,
        "/api/v1/push/users",
        Some(1),
        Some(json!({"user_ids": [1, 2, 3], "body": "Hello all"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(multi["total_users"], 3);
    assert_eq!(multi["results"]["2"].as_array().unwrap().len(), 0);
    assert_eq!(multi["results"]["1"].as_array().unwrap().len(), 1);

    let (status, topic) = call(
        &app,
        Method::POST,
        "/api/v1/push/topic",
        Some(1),
        Some(json!({"topic": "news", "title": "Breaking"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(topic["success"], true);
}

#[tokio::test]
async fn push_rejects_empty_message() {
    let app = app();
    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/push/device",
        Some(1),
        Some(json!({"token": "tokA"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn validate_reports_shape_failures() {
    let app = app();
    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/push/validate",
        Some(1),
        Some(json!({"token": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], false);

    let (_, body) = call(
        &app,
        Method::POST,
        "/api/v1/push/validate",
        Some(1),
        Some(json!({"token": "tokA"})),
    )
    .await;
    assert_eq!(body["valid"], true);
}
