use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// Machine readable failure category shared by HTTP problems and `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The body was empty or too long.
    #[serde(rename = "validation_error")]
    Validation,
    /// The requester may not perform the action.
    #[serde(rename = "authorization_error")]
    Authorization,
    /// The target message does not exist or was removed.
    NotFound,
    /// The requester exceeded the submission rate.
    RateLimited,
    /// Storage or transport failed; retrying may succeed.
    TransientIo,
}

impl ErrorCode {
    /// Stable wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::Authorization => "authorization_error",
            Self::NotFound => "not_found",
            Self::RateLimited => "rate_limited",
            Self::TransientIo => "transient_io",
        }
    }

    /// Whether the client should offer to retry the same request.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::TransientIo)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-side view of an RFC 7807 problem returned by the server.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, ToSchema)]
pub struct ApiProblem {
    /// Stable machine readable code, e.g. `validation_error`.
    pub code: String,
    /// Human readable reason.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiProblem {
    /// Seconds the server asked the client to wait, when rate limited.
    #[must_use]
    pub fn retry_after_seconds(&self) -> Option<u64> {
        self.details
            .as_ref()
            .and_then(|details| details.get("retry_after_seconds"))
            .and_then(serde_json::Value::as_u64)
    }

    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.code == ErrorCode::RateLimited.as_str() || self.code == ErrorCode::TransientIo.as_str()
    }
}

impl fmt::Display for ApiProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
