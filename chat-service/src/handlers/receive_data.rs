//! `POST /receive-data` and its streaming variant.

use crate::config::StreamMode;
use crate::models::{validate_payload, ValidatedPayload};
use crate::services::generator::LiveTextStream;
use crate::startup::AppState;
use axum::{
    body::Bytes,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{stream, Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use service_core::envelope::Envelope;
use service_core::error::AppError;
use std::convert::Infallible;

pub const SUCCESS_MESSAGE: &str = "Response generated successfully.";

/// Parse the body as JSON and run schema validation.
fn parse_payload(state: &AppState, body: &[u8]) -> Result<ValidatedPayload, AppError> {
    let raw: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::MalformedRequest(e.to_string()))?;

    validate_payload(&raw, &state.validation_policy()).map_err(|errors| {
        AppError::SchemaValidation {
            errors,
            expose: state.config.validation.expose_details,
        }
    })
}

#[tracing::instrument(name = "receive_data", skip(state, body), fields(user_id = tracing::field::Empty))]
pub async fn receive_data(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Envelope, AppError> {
    let payload = parse_payload(&state, &body)?;
    tracing::Span::current().record("user_id", payload.user_id.as_str());

    let text = state
        .generator
        .generate(&payload.user_id, &payload.message)
        .await?;

    Ok(Envelope::success(text, SUCCESS_MESSAGE))
}

/// Server-sent events: `chunk` events with `{"text": ...}`, then a `done`
/// event holding the success envelope, or an `error` event holding an error
/// envelope if the upstream fails mid-stream.
#[tracing::instrument(name = "receive_data_stream", skip(state, body), fields(user_id = tracing::field::Empty))]
pub async fn receive_data_stream(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let payload = parse_payload(&state, &body)?;
    tracing::Span::current().record("user_id", payload.user_id.as_str());

    let streaming = &state.config.streaming;
    let chunks: LiveTextStream = match streaming.mode {
        StreamMode::Rechunk => state
            .generator
            .generate_streaming(&payload.user_id, &payload.message, streaming.chunk_size)
            .await?
            .map(Ok)
            .boxed(),
        StreamMode::Native => {
            state
                .generator
                .generate_native_stream(&payload.user_id, &payload.message)
                .await?
        }
    };

    Ok(Sse::new(sse_events(chunks)).keep_alive(KeepAlive::default()))
}

fn sse_events(chunks: LiveTextStream) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Some((chunks, String::new())), |state| async move {
        let (mut chunks, mut full_text) = state?;

        match chunks.next().await {
            Some(Ok(text)) => {
                full_text.push_str(&text);
                let event = json_event("chunk", &json!({ "text": text }));
                Some((Ok(event), Some((chunks, full_text))))
            }
            Some(Err(e)) => {
                let err = AppError::from(e);
                tracing::error!(error = %err, "Stream failed");
                let envelope = Envelope::error(
                    err.status_code().as_u16(),
                    err.public_message(),
                    Value::Null,
                );
                Some((Ok(json_event("error", &envelope)), None))
            }
            None => {
                let envelope = Envelope::success(full_text, SUCCESS_MESSAGE);
                Some((Ok(json_event("done", &envelope)), None))
            }
        }
    })
}

fn json_event(name: &str, payload: &impl Serialize) -> Event {
    Event::default()
        .event(name)
        .json_data(payload)
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, event = name, "Failed to serialize event");
            Event::default().event("error")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::generator::GenerationError;
    use axum::response::IntoResponse;

    /// Render the events through `Sse` and return `(event name, data)` pairs.
    async fn render(chunks: Vec<Result<String, GenerationError>>) -> Vec<(String, Value)> {
        let response = Sse::new(sse_events(Box::pin(stream::iter(chunks)))).into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();

        body.split("\n\n")
            .filter(|block| !block.trim().is_empty())
            .map(|block| {
                let mut name = String::new();
                let mut data = String::new();
                for line in block.lines() {
                    if let Some(rest) = line.strip_prefix("event:") {
                        name = rest.trim().to_string();
                    } else if let Some(rest) = line.strip_prefix("data:") {
                        data.push_str(rest.trim_start());
                    }
                }
                (name, serde_json::from_str(&data).unwrap())
            })
            .collect()
    }

    #[tokio::test]
    async fn test_events_end_with_done() {
        let events = render(vec![Ok("hi ".to_string()), Ok("there".to_string())]).await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].0, "chunk");
        assert_eq!(events[0].1["text"], "hi ");
        assert_eq!(events[1].1["text"], "there");

        let (name, done) = &events[2];
        assert_eq!(name, "done");
        assert_eq!(done["status"], "success");
        assert_eq!(done["data"], "hi there");
        assert_eq!(done["message"], SUCCESS_MESSAGE);
        assert!(done.get("error_code").is_none());
    }

    #[tokio::test]
    async fn test_error_ends_stream() {
        let events = render(vec![
            Ok("partial".to_string()),
            Err(GenerationError::Connection("reset".to_string())),
            Ok("never sent".to_string()),
        ])
        .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "chunk");
        assert_eq!(events[0].1["text"], "partial");

        let (name, error) = &events[1];
        assert_eq!(name, "error");
        assert_eq!(error["status"], "error");
        assert_eq!(error["error_code"], 503);
        assert!(error["data"].is_null());
        assert!(!error.to_string().contains("reset"));
    }

    #[tokio::test]
    async fn test_execution_error_event_carries_500() {
        let events = render(vec![Err(GenerationError::Execution("quota".to_string()))]).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "error");
        assert_eq!(events[0].1["error_code"], 500);
    }
}
