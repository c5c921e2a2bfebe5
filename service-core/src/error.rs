use crate::envelope::{Status, render};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// What went wrong with a single request field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldIssue {
    Missing,
    TooLong { max: u64 },
    InvalidType,
    Invalid,
}

/// A field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Dotted path of the offending field, e.g. `user_data.browser_data.language`.
    pub field: String,
    pub issue: FieldIssue,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, issue: FieldIssue, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            issue,
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Schema validation failed: {}", join_field_errors(.errors))]
    SchemaValidation {
        errors: Vec<FieldError>,
        /// Whether the field list is returned to the client.
        expose: bool,
    },

    #[error("Upstream connection failure: {0}")]
    UpstreamConnection(String),

    #[error("Upstream execution failure: {0}")]
    UpstreamExecution(String),

    #[error("Upstream unknown failure: {0}")]
    UpstreamUnknown(String),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::MalformedRequest(_) | AppError::SchemaValidation { .. } => {
                StatusCode::BAD_REQUEST
            }
            AppError::UpstreamConnection(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UpstreamExecution(_)
            | AppError::UpstreamUnknown(_)
            | AppError::InternalError(_)
            | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Upstream and internal detail stays in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            AppError::MalformedRequest(_) => "Request body must be valid JSON.",
            AppError::SchemaValidation { .. } => "Invalid request data.",
            AppError::UpstreamConnection(_) => {
                "The response service is unavailable. Please try again later."
            }
            AppError::UpstreamExecution(_) => "The response service failed to process the request.",
            AppError::UpstreamUnknown(_) => "An unexpected error occurred while generating the response.",
            AppError::InternalError(_) => "Internal server error",
            AppError::ConfigError(_) => "Configuration error",
        }
    }

    fn public_data(&self) -> Value {
        match self {
            AppError::SchemaValidation {
                errors,
                expose: true,
            } => serde_json::to_value(errors).unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            AppError::MalformedRequest(_) | AppError::SchemaValidation { .. } => {
                tracing::warn!(error = %self, "Rejected request");
            }
            _ => {
                tracing::error!(error = %self, "Request failed");
            }
        }

        render(
            Status::Error,
            status.as_u16(),
            self.public_data(),
            self.public_message(),
            false,
        )
        .into_response()
    }
}
