use shared::models::{ErrorCode, ShoutboxEvent};
use thiserror::Error;

use super::store::StoreError;

/// Failures surfaced by ingestion and the session manager.
#[derive(Debug, Error)]
pub enum ShoutboxError {
    /// Body empty or over the length limit.
    #[error("{0}")]
    Validation(String),
    /// Requester is not allowed to act on the message.
    #[error("{0}")]
    Authorization(String),
    /// Message or session does not exist.
    #[error("{0}")]
    NotFound(String),
    /// Requester exceeded the submission rate.
    #[error("rate limit exceeded; retry in {retry_after_seconds}s")]
    RateLimited {
        /// Seconds until the oldest counted submission leaves the window.
        retry_after_seconds: u64,
    },
    /// Storage failed; the request may be retried.
    #[error("storage unavailable: {0}")]
    TransientIo(#[source] StoreError),
}

/// Result alias for shoutbox operations.
pub type ShoutboxResult<T> = Result<T, ShoutboxError>;

impl ShoutboxError {
    /// Wire category of the failure.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::Validation,
            Self::Authorization(_) => ErrorCode::Authorization,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::TransientIo(_) => ErrorCode::TransientIo,
        }
    }

    /// Error event addressed to the session that caused the failure.
    #[must_use]
    pub fn to_event(&self) -> ShoutboxEvent {
        let retry_after = match self {
            Self::RateLimited {
                retry_after_seconds,
            } => Some(*retry_after_seconds),
            _ => None,
        };
        ShoutboxEvent::error(self.code(), self.to_string(), retry_after)
    }
}

impl From<StoreError> for ShoutboxError {
    fn from(err: StoreError) -> Self {
        Self::TransientIo(err)
    }
}
