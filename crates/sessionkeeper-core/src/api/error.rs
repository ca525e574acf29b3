use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use super::transport::TransportError;

/// Message the service puts in a 401 body when the bearer token is no longer
/// accepted.
const UNAUTHORIZED_MESSAGE: &str = "Unauthorized";

/// Outcome taxonomy every caller sees. Raw transport and status detail never
/// escapes past this type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Request rejected: {0}")]
    Request(String),

    #[error("Invalid response: {0}")]
    Response(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Token expired - reauthentication required")]
    TokenExpired,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// JSON error body returned on non-200 responses
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Classify a non-success HTTP response.
    pub fn from_response(status: StatusCode, body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        let truncated = Self::truncate_body(&text);
        match status.as_u16() {
            401 => match serde_json::from_slice::<ErrorBody>(body) {
                Ok(err) if err.message == UNAUTHORIZED_MESSAGE => ApiError::TokenExpired,
                _ => ApiError::Request(format!("Status {}: {}", status, truncated)),
            },
            400..=499 => ApiError::Request(format!("Status {}: {}", status, truncated)),
            _ => ApiError::Server(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Classify a failure where no HTTP response was received.
    pub fn from_transport(err: &TransportError) -> Self {
        match err {
            TransportError::InvalidRequest(msg) => ApiError::Unknown(msg.clone()),
            other => ApiError::Server(other.to_string()),
        }
    }

    /// Whether the user has to go through full re-registration
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, ApiError::TokenExpired)
    }
}
