//! Middleware module unit tests

use axum::{
    body::Body,
    http::{header, HeaderMap, Request, StatusCode},
    middleware,
    routing::get,
    Extension, Router,
};
use relaygate::config::{AppConfig, Settings};
use relaygate::handlers::AppState;
use relaygate::middleware::auth::{auth_middleware, extract_bearer};
use relaygate::middleware::logging::{request_logging_middleware, RequestId};
use relaygate::services::Caller;
use std::sync::Arc;
use tower::ServiceExt;

const CONFIG: &str = r#"{
    "channels": {"main": {"type": "openai", "baseUrl": "https://api.openai.com", "apiKey": "sk-up"}},
    "tokens": {"sk-relay-alice": {"id": 7, "name": "alice", "group": "vip", "quota": 1000}}
}"#;

fn test_state() -> Arc<AppState> {
    AppState::build(Settings::default(), AppConfig::from_json(CONFIG).unwrap()).unwrap()
}

async fn whoami(Extension(caller): Extension<Caller>) -> String {
    format!("{}:{}:{}", caller.token_id, caller.name, caller.group)
}

async fn echo_request_id(Extension(RequestId(id)): Extension<RequestId>) -> String {
    id
}

fn auth_app() -> Router {
    let state = test_state();
    Router::new()
        .route("/v1/whoami", get(whoami))
        .route("/health", get(|| async { "ok" }))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[test]
fn test_extract_bearer_variants() {
    let mut headers = HeaderMap::new();
    assert_eq!(extract_bearer(&headers), None);

    headers.insert(header::AUTHORIZATION, "Bearer  sk-relay-alice ".parse().unwrap());
    assert_eq!(extract_bearer(&headers), Some("sk-relay-alice"));

    headers.insert(header::AUTHORIZATION, "BEARER sk-relay-alice".parse().unwrap());
    assert_eq!(extract_bearer(&headers), Some("sk-relay-alice"));

    headers.insert(header::AUTHORIZATION, "Token sk-relay-alice".parse().unwrap());
    assert_eq!(extract_bearer(&headers), None);
}

#[tokio::test]
async fn test_auth_attaches_caller() {
    let request = Request::builder()
        .uri("/v1/whoami")
        .header(header::AUTHORIZATION, "Bearer sk-relay-alice")
        .body(Body::empty())
        .unwrap();

    let response = auth_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "7:alice:vip");
}

#[tokio::test]
async fn test_auth_rejects_missing_and_unknown_keys() {
    let request = Request::builder().uri("/v1/whoami").body(Body::empty()).unwrap();
    let response = auth_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/v1/whoami")
        .header(header::AUTHORIZATION, "Bearer sk-relay-mallory")
        .body(Body::empty())
        .unwrap();
    let response = auth_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["error"]["code"], "invalid_api_key");
}

#[tokio::test]
async fn test_auth_skips_health() {
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = auth_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_request_id_is_generated_and_echoed() {
    let app = Router::new()
        .route("/id", get(echo_request_id))
        .layer(middleware::from_fn(request_logging_middleware));

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/id").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let header_id = response.headers()["x-request-id"].to_str().unwrap().to_string();
    assert!(uuid::Uuid::parse_str(&header_id).is_ok());
    assert_eq!(body_string(response).await, header_id);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/id")
                .header("x-request-id", "trace-abc-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "trace-abc-123");
    assert_eq!(body_string(response).await, "trace-abc-123");
}
