//! Error taxonomy for the client runtime.
//!
//! Every kind here is structurally distinguishable so callers can pattern
//! match on the *kind* of failure rather than parsing a message string.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("transient transport error: {0}")]
    Transient(String),

    #[error("cryptographic verification failed: {0}")]
    Crypto(String),

    #[error("retry queue is full")]
    QueueFull,

    #[error("retry horizon exceeded")]
    Expired,

    #[error("recipient is not a contact")]
    NotAContact,

    #[error("unknown community: {0}")]
    UnknownCommunity(String),
}

impl ClientError {
    /// Whether this failure should drive retry/failover accounting rather
    /// than being surfaced immediately as a terminal outcome.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient(_) | ClientError::RateLimited { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Delivered,
    Queued,
    Failed,
    Expired,
}

/// The outcome of a single `send` call, as returned to the host application.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SendOutcome {
    pub status: SendStatus,
    pub message_id: Option<uuid::Uuid>,
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn delivered(message_id: uuid::Uuid) -> Self {
        Self {
            status: SendStatus::Delivered,
            message_id: Some(message_id),
            error: None,
        }
    }

    pub fn queued(message_id: uuid::Uuid) -> Self {
        Self {
            status: SendStatus::Queued,
            message_id: Some(message_id),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: SendStatus::Failed,
            message_id: None,
            error: Some(error.into()),
        }
    }
}
