use serde::Deserialize;
use thiserror::Error;

/// Closed tag UI code branches on instead of raw transport status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApiErrorKind {
    Network,
    Unauthorized,
    Forbidden,
    Validation,
    NotFound,
    Server,
    Unclassified,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Normalized REST failure.
#[derive(Clone, Debug, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        fields: Vec<FieldError>,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("request failed: {message}")]
    Unclassified {
        status: Option<u16>,
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<Detail>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Detail {
    Text(String),
    Items(Vec<DetailItem>),
}

#[derive(Debug, Deserialize)]
struct DetailItem {
    #[serde(default)]
    loc: Vec<serde_json::Value>,
    #[serde(default)]
    msg: String,
}

impl ApiError {
    pub fn kind(&self) -> ApiErrorKind {
        match self {
            ApiError::Network(_) => ApiErrorKind::Network,
            ApiError::Unauthorized(_) => ApiErrorKind::Unauthorized,
            ApiError::Forbidden(_) => ApiErrorKind::Forbidden,
            ApiError::Validation { .. } => ApiErrorKind::Validation,
            ApiError::NotFound(_) => ApiErrorKind::NotFound,
            ApiError::Server { .. } => ApiErrorKind::Server,
            ApiError::Unclassified { .. } => ApiErrorKind::Unclassified,
        }
    }

    /// Build from an HTTP status and (possibly empty) response body.
    pub fn from_status(status: u16, body: &str) -> Self {
        let (message, fields) = parse_error_body(body);
        let message = message.unwrap_or_else(|| default_message(status).to_string());
        match status {
            401 => ApiError::Unauthorized(message),
            403 => ApiError::Forbidden(message),
            404 => ApiError::NotFound(message),
            422 => ApiError::Validation { message, fields },
            500..=599 => ApiError::Server { status, message },
            _ => ApiError::Unclassified {
                status: Some(status),
                message,
            },
        }
    }

    pub fn decode(context: &str, err: impl std::fmt::Display) -> Self {
        ApiError::Unclassified {
            status: None,
            message: format!("{}: {}", context, err),
        }
    }

    /// Toast text for a failed user-initiated `action` (e.g. "acknowledge violation").
    pub fn user_message(&self, action: &str) -> String {
        match self {
            ApiError::Network(_) => format!(
                "Could not {}: the server is unreachable. Check your connection and try again.",
                action
            ),
            ApiError::Unauthorized(_) => {
                "Your session has expired. Please sign in again.".to_string()
            }
            ApiError::Forbidden(_) => format!("You do not have permission to {}.", action),
            ApiError::Validation { message, fields } => {
                if fields.is_empty() {
                    format!("Could not {}: {}", action, message)
                } else {
                    let details: Vec<String> = fields
                        .iter()
                        .map(|f| format!("{}: {}", f.field, f.message))
                        .collect();
                    format!("Could not {}: {}", action, details.join("; "))
                }
            }
            ApiError::NotFound(_) => format!("Could not {}: the item no longer exists.", action),
            ApiError::Server { .. } => format!(
                "Could not {}: the server reported an error. Try again later.",
                action
            ),
            ApiError::Unclassified { message, .. } => format!("Could not {}: {}", action, message),
        }
    }
}

fn parse_error_body(body: &str) -> (Option<String>, Vec<FieldError>) {
    let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) else {
        let trimmed = body.trim();
        return if trimmed.is_empty() || trimmed.len() > 200 {
            (None, Vec::new())
        } else {
            (Some(trimmed.to_string()), Vec::new())
        };
    };
    match parsed.detail {
        Some(Detail::Text(text)) => (Some(text), Vec::new()),
        Some(Detail::Items(items)) => {
            let fields: Vec<FieldError> = items
                .into_iter()
                .map(|item| FieldError {
                    field: item
                        .loc
                        .last()
                        .map(|v| match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .unwrap_or_else(|| "request".to_string()),
                    message: item.msg,
                })
                .collect();
            let summary = fields
                .first()
                .map(|f| format!("{}: {}", f.field, f.message));
            (summary.or(parsed.message), fields)
        }
        None => (parsed.message, Vec::new()),
    }
}

fn default_message(status: u16) -> &'static str {
    match status {
        400 => "bad request",
        401 => "authentication required",
        403 => "forbidden",
        404 => "not found",
        409 => "conflict",
        422 => "invalid request",
        429 => "too many requests",
        500..=599 => "internal server error",
        _ => "unexpected response",
    }
}
