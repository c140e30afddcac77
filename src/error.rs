//! Error types for the Turnstile service.

use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Bad or missing configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store could not be reached or returned garbage
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// The threshold source failed and no fallback applied
    #[error("Threshold source error: {0}")]
    ThresholdSource(String),

    /// The caller used up its quota for the current window
    #[error("Rate limit exceeded, retry after {}s", .retry_after.as_secs())]
    RateLimitExceeded { retry_after: Duration },

    /// No client address could be determined for the request
    #[error("Client identity unavailable")]
    MissingClientIdentity,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// HTTP status this error renders as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            TurnstileError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            TurnstileError::StoreUnavailable(_) | TurnstileError::ThresholdSource(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            TurnstileError::MissingClientIdentity => StatusCode::BAD_REQUEST,
            TurnstileError::Config(_) | TurnstileError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TurnstileError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            TurnstileError::RateLimitExceeded { retry_after } => {
                // Round up so clients never retry a fraction of a second early
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                (
                    status,
                    [(header::RETRY_AFTER, secs.to_string())],
                    Json(json!({
                        "error": "rate limit exceeded",
                        "retry_after": secs,
                    })),
                )
                    .into_response()
            }
            TurnstileError::MissingClientIdentity => (
                status,
                Json(json!({ "error": "client identity unavailable" })),
            )
                .into_response(),
            other if status == StatusCode::SERVICE_UNAVAILABLE => (
                status,
                Json(json!({
                    "error": "service unavailable",
                    "detail": other.to_string(),
                })),
            )
                .into_response(),
            _ => (
                status,
                Json(json!({ "error": "internal server error" })),
            )
                .into_response(),
        }
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let exceeded = TurnstileError::RateLimitExceeded {
            retry_after: Duration::from_secs(5),
        };
        assert_eq!(exceeded.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            TurnstileError::StoreUnavailable("down".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            TurnstileError::ThresholdSource("timeout".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            TurnstileError::MissingClientIdentity.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_rate_limit_response_rounds_retry_after_up() {
        let response = TurnstileError::RateLimitExceeded {
            retry_after: Duration::from_millis(1500),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }
}
