#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Request, Response, StatusCode},
    Router,
};
use chat_service::config::{
    ChatConfig, GeminiSettings, GenerationSettings, ProviderKind, SessionSettings, StreamMode,
    StreamingSettings, ValidationSettings,
};
use chat_service::services::providers::TextProvider;
use chat_service::{build_router, AppState};
use serde_json::Value;
use std::sync::Arc;
use tower::util::ServiceExt;

/// Mock-backed configuration that never reads the environment.
pub fn test_config() -> ChatConfig {
    ChatConfig {
        common: service_core::config::Config::default(),
        provider: ProviderKind::Mock,
        gemini: GeminiSettings {
            api_key: String::new(),
            model: "gemini-1.5-flash".to_string(),
            request_timeout_secs: 5,
        },
        generation: GenerationSettings::default(),
        sessions: SessionSettings::default(),
        streaming: StreamingSettings {
            mode: StreamMode::Rechunk,
            chunk_size: 4,
            chunk_delay_ms: 0,
        },
        validation: ValidationSettings::default(),
    }
}

pub fn app_with(config: ChatConfig, provider: Arc<dyn TextProvider>) -> Router {
    build_router(AppState::new(config, provider))
}

pub fn app(provider: Arc<dyn TextProvider>) -> Router {
    app_with(test_config(), provider)
}

pub async fn post(app: Router, uri: &str, body: impl Into<String>) -> Response<Body> {
    app.oneshot(
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.into()))
            .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: impl Into<String>) -> (StatusCode, Value) {
    let response = post(app, uri, body).await;
    let status = response.status();
    let body_json: Value = serde_json::from_str(&body_text(response).await).unwrap();
    (status, body_json)
}

/// Assert the fields every envelope carries.
pub fn assert_envelope(body: &Value, status: &str) {
    assert_eq!(body["status"], status);
    assert!(body["message"].is_string());
    assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
    assert_eq!(body["request_id"].as_str().unwrap().len(), 36);
    match status {
        "error" => assert!(body["error_code"].is_u64()),
        _ => assert!(body.get("error_code").is_none()),
    }
}

/// Parse a server-sent events body into `(event, data)` pairs.
pub fn parse_sse(body: &str) -> Vec<(String, Value)> {
    let mut events = Vec::new();
    let mut name = String::new();
    let mut data = String::new();

    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            name = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push_str(rest.trim_start());
        } else if line.is_empty() && !data.is_empty() {
            events.push((
                std::mem::take(&mut name),
                serde_json::from_str(&std::mem::take(&mut data)).unwrap(),
            ));
        }
    }
    events
}
