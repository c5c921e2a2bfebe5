//! Standard JSON envelope returned by every endpoint.
//!
//! Every rendered envelope carries a UTC RFC 3339 timestamp and a freshly
//! generated request id. `error_code` is present exactly when the status is
//! `error`.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Outcome carried in the envelope's `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Size summary attached when a detailed envelope wraps a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Details {
    pub length: usize,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub status: Status,
    pub message: String,
    pub data: Value,
    pub timestamp: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Details>,
}

impl Envelope {
    fn new(status: Status, code: u16, data: Value, message: String, detailed: bool) -> Self {
        let details = if detailed { describe(&data) } else { None };

        Self {
            status,
            message,
            data,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            request_id: Uuid::new_v4().to_string(),
            error_code: match status {
                Status::Error => Some(code),
                Status::Success => None,
            },
            details,
        }
    }

    pub fn success(data: impl Into<Value>, message: impl Into<String>) -> Self {
        Self::new(Status::Success, 200, data.into(), message.into(), false)
    }

    pub fn error(code: u16, message: impl Into<String>, data: impl Into<Value>) -> Self {
        Self::new(Status::Error, code, data.into(), message.into(), false)
    }
}

/// Human-readable collection kind plus its length, for arrays and objects only.
fn describe(data: &Value) -> Option<Details> {
    match data {
        Value::Array(items) => Some(Details {
            length: items.len(),
            type_name: "list".to_string(),
        }),
        Value::Object(map) => Some(Details {
            length: map.len(),
            type_name: "dict".to_string(),
        }),
        _ => None,
    }
}

/// Render an envelope together with the HTTP status it should be returned with.
///
/// Codes that are not valid HTTP statuses are sent as 500 while the envelope
/// still records the requested `error_code`.
pub fn render(
    status: Status,
    code: u16,
    data: impl Into<Value>,
    message: impl Into<String>,
    detailed: bool,
) -> (StatusCode, Json<Envelope>) {
    let http_status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let envelope = Envelope::new(status, code, data.into(), message.into(), detailed);

    (http_status, Json(envelope))
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        let code = match (self.status, self.error_code) {
            (Status::Error, Some(code)) => {
                StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            _ => StatusCode::OK,
        };
        (code, Json(self)).into_response()
    }
}
