use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Error code the server puts in a 401 body when the access token expired.
pub const TOKEN_EXPIRED_CODE: &str = "TOKEN_EXPIRED";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access token expired")]
    TokenExpired,

    #[error("Permission denied ({status}): {message}")]
    PermissionDenied { status: u16, message: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Request failed with status {status}: {message}")]
    Unexpected { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    Configuration(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error body shape used by the backend: `{"code": "...", "message": "..."}`
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    pub code: Option<String>,
    pub message: Option<String>,
}

impl ErrorBody {
    pub(crate) fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }
}

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

    /// Classify a non-success response. Only a 401 carrying the
    /// `TOKEN_EXPIRED` code is recoverable by refreshing.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let parsed = ErrorBody::parse(body);
        let message = parsed
            .message
            .unwrap_or_else(|| Self::truncate_body(body));

        match status.as_u16() {
            401 if parsed.code.as_deref() == Some(TOKEN_EXPIRED_CODE) => ApiError::TokenExpired,
            401 | 403 => ApiError::PermissionDenied {
                status: status.as_u16(),
                message,
            },
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(message),
            _ => ApiError::Unexpected {
                status: status.as_u16(),
                message,
            },
        }
    }

    /// Whether this failure can be recovered by refreshing the access token
    pub fn is_token_expired(&self) -> bool {
        matches!(self, ApiError::TokenExpired)
    }
}
