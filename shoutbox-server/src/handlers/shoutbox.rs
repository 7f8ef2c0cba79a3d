use std::{convert::Infallible, sync::Arc};

use axum::{
    Extension, Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt, stream};
use serde::Deserialize;
use shared::{
    config::server::Config,
    models::{
        EditMessageRequest, HistoryPage, HistoryQuery, Message, MessageId, OnlineResponse,
        ShoutboxSettings, SubmitMessageRequest,
    },
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{instrument, warn};
use utoipa::IntoParams;
use uuid::Uuid;

use crate::{
    app_state::AppState,
    http::{
        error::{ApiError, AppResult},
        extract::{ApiJson, ApiPath, ApiQuery},
        problem::ProblemDetails,
    },
    middleware::request_context::RequestContext,
    services::{
        error::ShoutboxError,
        fanout::StreamEvent,
        session_manager::{Session, SharedSessionManager},
    },
};

/// Query parameters of `GET /api/shoutbox/stream`.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StreamQuery {
    /// Fanout cursor from a history page; superseded by `Last-Event-ID`.
    pub since: Option<u64>,
}

#[utoipa::path(
    get,
    path = "/api/shoutbox/history",
    params(HistoryQuery),
    responses(
        (status = 200, description = "Newest-first page of messages", body = HistoryPage),
        (status = 503, description = "Storage unavailable", body = ProblemDetails)
    ),
    tag = "Shoutbox"
)]
#[instrument(skip(state, config))]
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Extension(config): Extension<Arc<Config>>,
    ApiQuery(query): ApiQuery<HistoryQuery>,
) -> AppResult<Json<HistoryPage>> {
    let limit = query
        .limit
        .unwrap_or(config.shoutbox.default_history_limit)
        .clamp(1, config.shoutbox.history_page_size);

    // Read the head first: anything published later is replayed on attach.
    let cursor = state.sessions.fanout().head().await;
    let (messages, has_more) = state
        .sessions
        .pipeline()
        .store()
        .history(query.before, limit)
        .await
        .map_err(ShoutboxError::from)?;

    Ok(Json(HistoryPage {
        messages,
        cursor,
        has_more,
    }))
}

#[utoipa::path(
    post,
    path = "/api/shoutbox/messages",
    request_body = SubmitMessageRequest,
    responses(
        (status = 201, description = "Message accepted", body = Message),
        (status = 400, description = "Empty or overlong body", body = ProblemDetails),
        (status = 401, description = "No identity", body = ProblemDetails),
        (status = 429, description = "Rate limited", body = ProblemDetails),
        (status = 503, description = "Storage unavailable", body = ProblemDetails)
    ),
    tag = "Shoutbox"
)]
#[instrument(skip(state, context, request), fields(request_id = %context.request_id))]
pub async fn post_message(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    ApiJson(request): ApiJson<SubmitMessageRequest>,
) -> AppResult<(StatusCode, Json<Message>)> {
    let identity = context.require_identity()?;
    let message = state
        .sessions
        .submit(identity, context.session_id, &request.body)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[utoipa::path(
    patch,
    path = "/api/shoutbox/messages/{id}",
    params(("id" = i64, Path, description = "Message id")),
    request_body = EditMessageRequest,
    responses(
        (status = 200, description = "Edit accepted", body = Message),
        (status = 400, description = "Empty or overlong body", body = ProblemDetails),
        (status = 403, description = "Not the author", body = ProblemDetails),
        (status = 404, description = "No such message", body = ProblemDetails),
        (status = 429, description = "Rate limited", body = ProblemDetails)
    ),
    tag = "Shoutbox"
)]
#[instrument(skip(state, context, request), fields(request_id = %context.request_id))]
pub async fn edit_message(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    ApiPath(id): ApiPath<MessageId>,
    ApiJson(request): ApiJson<EditMessageRequest>,
) -> AppResult<Json<Message>> {
    let identity = context.require_identity()?;
    let message = state
        .sessions
        .submit_edit(identity, context.session_id, id, &request.body)
        .await?;
    Ok(Json(message))
}

#[utoipa::path(
    get,
    path = "/api/shoutbox/stream",
    params(StreamQuery),
    responses(
        (status = 200, description = "Server-sent event stream", content_type = "text/event-stream"),
        (status = 403, description = "Anonymous viewing disabled", body = ProblemDetails)
    ),
    tag = "Shoutbox"
)]
#[instrument(skip(state, config, context, headers), fields(request_id = %context.request_id))]
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Extension(config): Extension<Arc<Config>>,
    Extension(context): Extension<RequestContext>,
    ApiQuery(query): ApiQuery<StreamQuery>,
    headers: HeaderMap,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let prefix = config.fanout.id_prefix.clone();
    let since = last_event_sequence(&headers, &prefix).or(query.since);

    let opened = state.sessions.open(context.identity.clone(), since).await?;
    let preamble = opened.preamble();
    let token = opened.session.cancellation_token();
    let guard = SessionGuard {
        sessions: Arc::clone(&state.sessions),
        session_id: opened.session.id(),
    };

    let events = stream::iter(preamble)
        .chain(ReceiverStream::new(opened.attachment.receiver))
        .take_until(token.cancelled_owned())
        .map(move |event| {
            let _ = &guard;
            Ok::<_, Infallible>(to_sse_event(&prefix, &event))
        });

    let keep_alive = KeepAlive::new()
        .interval(config.fanout.heartbeat_interval())
        .text("keep-alive");

    Ok(Sse::new(events).keep_alive(keep_alive))
}

#[utoipa::path(
    post,
    path = "/api/shoutbox/sessions/{id}/heartbeat",
    params(("id" = Uuid, Path, description = "Session id")),
    responses(
        (status = 204, description = "Session kept alive"),
        (status = 403, description = "Session belongs to someone else", body = ProblemDetails),
        (status = 404, description = "Unknown session", body = ProblemDetails)
    ),
    tag = "Shoutbox"
)]
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    ApiPath(session_id): ApiPath<Uuid>,
) -> AppResult<StatusCode> {
    owned_session(&state.sessions, &context, session_id).await?;
    state.sessions.touch(session_id).await;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/api/shoutbox/sessions/{id}",
    params(("id" = Uuid, Path, description = "Session id")),
    responses(
        (status = 204, description = "Session closed"),
        (status = 403, description = "Session belongs to someone else", body = ProblemDetails),
        (status = 404, description = "Unknown session", body = ProblemDetails)
    ),
    tag = "Shoutbox"
)]
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    ApiPath(session_id): ApiPath<Uuid>,
) -> AppResult<StatusCode> {
    owned_session(&state.sessions, &context, session_id).await?;
    state.sessions.close(session_id).await;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/shoutbox/online",
    responses((status = 200, description = "Identities with a live session", body = OnlineResponse)),
    tag = "Shoutbox"
)]
pub async fn online(State(state): State<Arc<AppState>>) -> Json<OnlineResponse> {
    Json(state.sessions.online().await)
}

#[utoipa::path(
    get,
    path = "/api/shoutbox/settings",
    responses((status = 200, description = "Limits and display defaults for clients", body = ShoutboxSettings)),
    tag = "Shoutbox"
)]
pub async fn settings(Extension(config): Extension<Arc<Config>>) -> Json<ShoutboxSettings> {
    Json(config.client_settings())
}

async fn owned_session(
    sessions: &SharedSessionManager,
    context: &RequestContext,
    session_id: Uuid,
) -> AppResult<Arc<Session>> {
    let session = sessions
        .session(session_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("session {session_id} not found")))?;
    if session.identity() != context.identity.as_deref() {
        return Err(ApiError::from(ShoutboxError::Authorization(
            "session belongs to another user".into(),
        )));
    }
    Ok(session)
}

fn last_event_sequence(headers: &HeaderMap, prefix: &str) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .and_then(|raw| raw.strip_prefix(prefix))
        .and_then(|sequence| sequence.parse().ok())
}

fn to_sse_event(prefix: &str, event: &StreamEvent) -> Event {
    let mut builder = Event::default().event(event.event.name());
    if let Some(sequence) = event.sequence {
        builder = builder.id(format!("{prefix}{sequence}"));
    }
    builder.json_data(&event.event).unwrap_or_else(|err| {
        warn!(error = %err, event = event.event.name(), "failed to encode stream event");
        Event::default().comment("encoding failed")
    })
}

/// Closes the session once the client's stream is dropped.
struct SessionGuard {
    sessions: SharedSessionManager,
    session_id: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let sessions = Arc::clone(&self.sessions);
        let session_id = self.session_id;
        handle.spawn(async move {
            sessions.close(session_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn last_event_id_requires_the_configured_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("last-event-id", HeaderValue::from_static("sb-42"));
        assert_eq!(last_event_sequence(&headers, "sb-"), Some(42));
        assert_eq!(last_event_sequence(&headers, "x-"), None);

        headers.insert("last-event-id", HeaderValue::from_static("sb-nope"));
        assert_eq!(last_event_sequence(&headers, "sb-"), None);
    }
}
