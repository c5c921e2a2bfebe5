mod common;

use axum::http::StatusCode;
use chat_service::services::providers::mock::{MockFailure, MockTextProvider};
use common::{app, body_text, get};
use std::sync::Arc;

#[tokio::test]
async fn health_check_works() {
    let response = get(app(Arc::new(MockTextProvider::echo())), "/health").await;

    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "chat-service");
}

#[tokio::test]
async fn readiness_follows_provider_health() {
    let response = get(app(Arc::new(MockTextProvider::echo())), "/ready").await;
    assert_eq!(response.status(), StatusCode::OK);

    let failing = Arc::new(MockTextProvider::failing(MockFailure::Network));
    let response = get(app(failing), "/ready").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let response = get(app(Arc::new(MockTextProvider::echo())), "/nope").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn receive_data_rejects_get() {
    let response = get(app(Arc::new(MockTextProvider::echo())), "/receive-data").await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}
