use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::validation::{FieldError, ValidationErrors};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Authentication required: {0}")]
    AuthenticationError(String),

    #[error("Request failed with status {status}: {message}")]
    ResponseError {
        status: u16,
        message: String,
        field_errors: Vec<FieldError>,
    },

    #[error("Validation failed: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

const NETWORK_MESSAGE: &str = "Unable to reach the store. Please check your connection and try again.";
const SERVER_MESSAGE: &str = "Something went wrong on our side. Please try again.";
const SESSION_MESSAGE: &str = "Your session has expired. Please log in again.";

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Build the error for a non-2xx response.
    ///
    /// The message comes from `error.message`, then `message`, then the
    /// status line. Field details are read from `error.details`, `details`
    /// or `errors`.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let parsed: Option<Value> = serde_json::from_str(body).ok();

        let message = parsed
            .as_ref()
            .and_then(extract_message)
            .unwrap_or_else(|| status.to_string());

        let field_errors = parsed
            .as_ref()
            .map(extract_field_errors)
            .unwrap_or_default();

        ApiError::ResponseError {
            status: status.as_u16(),
            message,
            field_errors,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::ResponseError { status, .. } => Some(*status),
            ApiError::AuthenticationError(_) => Some(StatusCode::UNAUTHORIZED.as_u16()),
            _ => None,
        }
    }

    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            ApiError::ResponseError { field_errors, .. } => field_errors,
            ApiError::ValidationError(errors) => errors.errors(),
            _ => &[],
        }
    }

    /// True when the caller should send the user back to login
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::AuthenticationError(_))
    }

    /// Text suitable for showing to a customer
    pub fn user_message(&self) -> String {
        match self {
            ApiError::NetworkError(_) => NETWORK_MESSAGE.to_string(),
            ApiError::AuthenticationError(_) => SESSION_MESSAGE.to_string(),
            ApiError::ResponseError { status, .. } if *status >= 500 => SERVER_MESSAGE.to_string(),
            ApiError::ResponseError { message, .. } => message.clone(),
            ApiError::ValidationError(errors) => errors.to_string(),
            ApiError::InvalidResponse(_) => SERVER_MESSAGE.to_string(),
            ApiError::InvalidRequest(message) => message.clone(),
        }
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn extract_message(body: &Value) -> Option<String> {
    non_empty_str(body.get("error").and_then(|e| e.get("message")))
        .or_else(|| non_empty_str(body.get("message")))
}

fn extract_field_errors(body: &Value) -> Vec<FieldError> {
    let candidates = [
        body.get("error").and_then(|e| e.get("details")),
        body.get("details"),
        body.get("errors"),
    ];
    candidates
        .into_iter()
        .flatten()
        .map(parse_field_errors)
        .find(|errors| !errors.is_empty())
        .unwrap_or_default()
}

/// Accepts `[{"field": .., "message": ..}]` or `{"field": "msg" | ["msg", ..]}`
fn parse_field_errors(value: &Value) -> Vec<FieldError> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let field = non_empty_str(item.get("field").or_else(|| item.get("path")))?;
                let message = non_empty_str(item.get("message"))?;
                Some(FieldError::new(field, message))
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .flat_map(|(field, messages)| {
                let messages: Vec<String> = match messages {
                    Value::String(s) => vec![s.clone()],
                    Value::Array(items) => items
                        .iter()
                        .filter_map(|m| m.as_str().map(str::to_string))
                        .collect(),
                    _ => Vec::new(),
                };
                messages
                    .into_iter()
                    .map(move |m| FieldError::new(field.clone(), m))
            })
            .collect(),
        _ => Vec::new(),
    }
}
