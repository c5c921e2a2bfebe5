//! Inbound `/receive-data` payload and its validation.
//!
//! Validation runs in two passes over the raw JSON. The first extracts the
//! declared fields, coercing scalars to strings and recording type errors. The
//! second applies the declarative rules below. Every failing field is reported,
//! ordered as the fields are declared.

use serde::Serialize;
use serde_json::{Map, Value};
use service_core::error::{FieldError, FieldIssue};
use std::borrow::Cow;
use validator::{Validate, ValidationError, ValidationErrors, ValidationErrorsKind};

/// Longest accepted message, in characters.
pub const MAX_MESSAGE_CHARS: u64 = 255;

/// Field paths in declaration order, used to order the error report.
const FIELD_ORDER: &[&str] = &[
    "$",
    "user_id",
    "message",
    "user_data",
    "user_data.id",
    "user_data.browser_data",
    "user_data.browser_data.user_agent",
    "user_data.browser_data.screen_resolution",
    "user_data.browser_data.language",
    "user_data.browser_data.platform",
];

#[derive(Debug, Default, Serialize, Validate)]
pub struct BrowserData {
    #[validate(required(message = "The 'userAgent' field is required."))]
    pub user_agent: Option<String>,
    #[validate(required(message = "The 'screenResolution' field is required."))]
    pub screen_resolution: Option<String>,
    #[validate(required(message = "The 'language' field is required."))]
    pub language: Option<String>,
    #[validate(required(message = "The 'platform' field is required."))]
    pub platform: Option<String>,
}

#[derive(Debug, Default, Validate)]
pub struct UserData {
    #[validate(required(message = "The 'id' field is required."))]
    pub id: Option<String>,
    #[validate(required(message = "The 'browserData' field is required."), nested)]
    pub browser_data: Option<BrowserData>,
}

/// Extracted, not yet validated payload.
#[derive(Debug, Default, Validate)]
pub struct ReceiveDataRequest {
    #[validate(required(message = "The 'user_id' field is required."))]
    pub user_id: Option<String>,
    #[validate(
        required(message = "The 'message' field is required."),
        length(max = 255, message = "The 'message' field must not exceed 255 characters.")
    )]
    pub message: Option<String>,
    #[validate(nested)]
    pub user_data: Option<UserData>,
}

/// Client metadata forwarded by browsers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientMetadata {
    pub id: String,
    pub user_agent: String,
    pub screen_resolution: String,
    pub language: String,
    pub platform: String,
}

/// A payload that passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedPayload {
    pub user_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientMetadata>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationPolicy {
    pub require_client_metadata: bool,
}

/// Validate a raw JSON body.
pub fn validate_payload(
    raw: &Value,
    policy: &ValidationPolicy,
) -> Result<ValidatedPayload, Vec<FieldError>> {
    let Some(object) = raw.as_object() else {
        return Err(vec![FieldError::new(
            "$",
            FieldIssue::InvalidType,
            "The request body must be a JSON object.",
        )]);
    };

    let mut errors = Vec::new();
    let request = extract(object, &mut errors);

    if policy.require_client_metadata && request.user_data.is_none() && !has_error(&errors, "user_data") {
        errors.push(FieldError::new(
            "user_data",
            FieldIssue::Missing,
            "The 'user_data' field is required.",
        ));
    }

    if let Err(validation_errors) = request.validate() {
        flatten_errors("", &validation_errors, &mut errors);
    }

    if !errors.is_empty() {
        errors.sort_by_key(|e| field_rank(&e.field));
        return Err(errors);
    }

    into_validated(request).ok_or_else(|| {
        vec![FieldError::new(
            "$",
            FieldIssue::Invalid,
            "The request could not be validated.",
        )]
    })
}

fn has_error(errors: &[FieldError], field: &str) -> bool {
    errors.iter().any(|e| e.field == field)
}

fn field_rank(field: &str) -> usize {
    FIELD_ORDER
        .iter()
        .position(|f| *f == field)
        .unwrap_or(FIELD_ORDER.len())
}

fn extract(object: &Map<String, Value>, errors: &mut Vec<FieldError>) -> ReceiveDataRequest {
    // `prompt_user` is the later name of `message`.
    let message_value = object
        .get("message")
        .filter(|v| !v.is_null())
        .or_else(|| object.get("prompt_user"));

    ReceiveDataRequest {
        user_id: coerce_string(object.get("user_id"), "user_id", errors),
        message: coerce_string(message_value, "message", errors),
        user_data: nested_object(object.get("user_data"), "user_data", errors)
            .map(|user_data| extract_user_data(user_data, errors)),
    }
}

fn extract_user_data(object: &Map<String, Value>, errors: &mut Vec<FieldError>) -> UserData {
    UserData {
        id: coerce_string(object.get("id"), "user_data.id", errors),
        browser_data: nested_object(
            object.get("browserData"),
            "user_data.browser_data",
            errors,
        )
        .map(|browser| BrowserData {
            user_agent: coerce_string(
                browser.get("userAgent"),
                "user_data.browser_data.user_agent",
                errors,
            ),
            screen_resolution: coerce_string(
                browser.get("screenResolution"),
                "user_data.browser_data.screen_resolution",
                errors,
            ),
            language: coerce_string(
                browser.get("language"),
                "user_data.browser_data.language",
                errors,
            ),
            platform: coerce_string(
                browser.get("platform"),
                "user_data.browser_data.platform",
                errors,
            ),
        }),
    }
}

/// Strings pass through, numbers and booleans become their JSON text, `null`
/// counts as absent. Anything else is a type error.
fn coerce_string(value: Option<&Value>, path: &str, errors: &mut Vec<FieldError>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(_) => {
            errors.push(FieldError::new(
                path,
                FieldIssue::InvalidType,
                format!("The '{}' field must be a string.", path),
            ));
            // Keep the field present so it is not also reported as missing.
            Some(String::new())
        }
    }
}

fn nested_object<'a>(
    value: Option<&'a Value>,
    path: &str,
    errors: &mut Vec<FieldError>,
) -> Option<&'a Map<String, Value>> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            errors.push(FieldError::new(
                path,
                FieldIssue::InvalidType,
                format!("The '{}' field must be an object.", path),
            ));
            None
        }
    }
}

fn flatten_errors(prefix: &str, errors: &ValidationErrors, out: &mut Vec<FieldError>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", prefix, field)
        };

        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                for error in field_errors {
                    out.push(to_field_error(&path, error));
                }
            }
            ValidationErrorsKind::Struct(nested) => flatten_errors(&path, nested, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    flatten_errors(&format!("{}[{}]", path, index), nested, out);
                }
            }
        }
    }
}

fn to_field_error(path: &str, error: &ValidationError) -> FieldError {
    let issue = match error.code.as_ref() {
        "required" => FieldIssue::Missing,
        "length" => FieldIssue::TooLong {
            max: error
                .params
                .get("max")
                .and_then(Value::as_u64)
                .unwrap_or(MAX_MESSAGE_CHARS),
        },
        _ => FieldIssue::Invalid,
    };
    let message = error
        .message
        .clone()
        .unwrap_or_else(|| Cow::Owned(format!("The '{}' field is invalid.", path)));

    FieldError::new(path, issue, message.into_owned())
}

fn into_validated(request: ReceiveDataRequest) -> Option<ValidatedPayload> {
    let client = match request.user_data {
        Some(user_data) => {
            let browser = user_data.browser_data?;
            Some(ClientMetadata {
                id: user_data.id?,
                user_agent: browser.user_agent?,
                screen_resolution: browser.screen_resolution?,
                language: browser.language?,
                platform: browser.platform?,
            })
        }
        None => None,
    };

    Some(ValidatedPayload {
        user_id: request.user_id?,
        message: request.message?,
        client,
    })
}
