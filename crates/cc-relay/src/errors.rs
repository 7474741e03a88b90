//! Relay-side error taxonomy, mapped to HTTP status codes at the
//! API boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64, remaining: u32 },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("gone: {0}")]
    Gone(String),
}

impl From<rusqlite::Error> for RelayError {
    fn from(err: rusqlite::Error) -> Self {
        RelayError::Internal(err.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            RelayError::Validation(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
            RelayError::Auth(msg) => (StatusCode::UNAUTHORIZED, json!({"error": msg})),
            RelayError::Forbidden(msg) => (StatusCode::FORBIDDEN, json!({"error": msg})),
            RelayError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({"error": msg})),
            RelayError::Conflict(msg) => (StatusCode::CONFLICT, json!({"error": msg})),
            RelayError::RateLimited { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, json!({"error": self.to_string()}))
            }
            RelayError::Gone(msg) => (StatusCode::GONE, json!({"error": msg})),
            RelayError::Internal(msg) => {
                tracing::error!(%msg, "internal relay error");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "internal error"}))
            }
        };
        let mut response = (status, Json(body)).into_response();
        if let RelayError::RateLimited { retry_after_secs, remaining } = self {
            let headers = response.headers_mut();
            headers.insert(
                "X-RateLimit-Remaining",
                remaining.to_string().parse().expect("digits are valid header values"),
            );
            headers.insert(
                "X-RateLimit-Reset",
                retry_after_secs.to_string().parse().expect("digits are valid header values"),
            );
        }
        response
    }
}
