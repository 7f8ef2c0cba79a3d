#![allow(clippy::needless_for_each)] // Derive macro emits a for_each internally

use shared::models::{
    EditMessageRequest, HistoryPage, Message, OnlineResponse, ShoutboxSettings,
    SubmitMessageRequest, Timestamp, UserProfile,
};
use utoipa::OpenApi;

use crate::http::problem::ProblemDetails;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Shoutbox API",
        version = "1.0.0",
        description = "Live shoutbox: history, submissions, edits, and the event stream"
    ),
    paths(
        crate::handlers::shoutbox::get_history,
        crate::handlers::shoutbox::post_message,
        crate::handlers::shoutbox::edit_message,
        crate::handlers::shoutbox::stream,
        crate::handlers::shoutbox::heartbeat,
        crate::handlers::shoutbox::close_session,
        crate::handlers::shoutbox::online,
        crate::handlers::shoutbox::settings,
        crate::handlers::users::get_user,
    ),
    components(
        schemas(
            Message,
            Timestamp,
            SubmitMessageRequest,
            EditMessageRequest,
            HistoryPage,
            OnlineResponse,
            ShoutboxSettings,
            UserProfile,
            ProblemDetails,
        )
    ),
    tags(
        (name = "Shoutbox", description = "Message history, submission, and live stream"),
        (name = "Users", description = "Public user profiles")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_shoutbox_path() {
        let doc = ApiDoc::openapi();
        for path in [
            "/api/shoutbox/history",
            "/api/shoutbox/messages",
            "/api/shoutbox/messages/{id}",
            "/api/shoutbox/stream",
            "/api/shoutbox/sessions/{id}/heartbeat",
            "/api/shoutbox/sessions/{id}",
            "/api/shoutbox/online",
            "/api/shoutbox/settings",
            "/api/users/{username}",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
