use axum::{
    http::{StatusCode, header::RETRY_AFTER},
    response::IntoResponse,
};
use http::HeaderValue;
use serde_json::json;
use thiserror::Error;

use super::problem::ProblemDetails;
use crate::services::error::ShoutboxError;

pub type AppResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthenticated", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    #[cfg(test)]
    pub(crate) const fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let retry_after = self
            .details
            .as_ref()
            .and_then(|details| details.get("retry_after_seconds"))
            .and_then(serde_json::Value::as_u64);

        let mut problem = ProblemDetails::new(self.status, self.code, self.message);
        if let Some(details) = self.details {
            problem = problem.with_details(details);
        }

        let mut response = problem.into_response();
        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

impl From<ShoutboxError> for ApiError {
    fn from(err: ShoutboxError) -> Self {
        let code = err.code().as_str();
        match err {
            ShoutboxError::Validation(message) => {
                Self::new(StatusCode::BAD_REQUEST, code, message)
            }
            ShoutboxError::Authorization(message) => {
                Self::new(StatusCode::FORBIDDEN, code, message)
            }
            ShoutboxError::NotFound(message) => Self::new(StatusCode::NOT_FOUND, code, message),
            ShoutboxError::RateLimited {
                retry_after_seconds,
            } => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                code,
                "too many messages; slow down",
            )
            .with_details(json!({ "retry_after_seconds": retry_after_seconds })),
            ShoutboxError::TransientIo(source) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                code,
                "message storage is temporarily unavailable; please retry",
            )
            .with_details(json!({ "retryable": true, "cause": source.to_string() })),
        }
    }
}
