use std::str::FromStr;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::http::error::{ApiError, AppResult};
use shared::config::server::Config;

/// Per-request facts extracted once by [`assign_request_context`].
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub request_id: String,
    /// Username asserted by the trusted upstream header.
    pub identity: Option<String>,
    /// Live session the caller claims to own.
    pub session_id: Option<Uuid>,
}

impl RequestContext {
    /// The caller's identity, or a 401 problem.
    pub fn require_identity(&self) -> AppResult<&str> {
        self.identity
            .as_deref()
            .ok_or_else(|| ApiError::unauthorized("an authenticated user is required"))
    }
}

#[derive(Clone, Debug)]
pub struct RequestContextState {
    request_id_header: HeaderName,
    identity_header: HeaderName,
    session_header: HeaderName,
}

impl RequestContextState {
    pub fn from_config(config: &Config) -> Self {
        let parse = |raw: &str, fallback: &'static str| {
            HeaderName::from_str(raw).unwrap_or_else(|_| HeaderName::from_static(fallback))
        };
        Self {
            request_id_header: parse(&config.server.request_id_header, "x-request-id"),
            identity_header: parse(&config.server.identity_header, "x-shoutbox-user"),
            session_header: parse(&config.server.session_header, "x-shoutbox-session"),
        }
    }
}

pub async fn assign_request_context(
    State(state): State<RequestContextState>,
    mut request: Request<Body>,
    next: Next,
) -> AppResult<Response> {
    let request_id = header_text(request.headers(), &state.request_id_header)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let identity = header_text(request.headers(), &state.identity_header);
    let session_id = header_text(request.headers(), &state.session_header)
        .and_then(|raw| Uuid::parse_str(&raw).ok());

    request.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
        identity,
        session_id,
    });

    let header_value = HeaderValue::from_str(&request_id)
        .map_err(|_| ApiError::internal_server_error("failed to encode request id"))?;
    request
        .headers_mut()
        .insert(state.request_id_header.clone(), header_value.clone());

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(state.request_id_header, header_value);

    Ok(response)
}

fn header_text(headers: &HeaderMap, header: &HeaderName) -> Option<String> {
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
