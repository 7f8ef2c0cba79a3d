use std::sync::Arc;

use axum::{
    Router,
    routing::{get, patch, post},
};

use crate::{
    app_state::AppState,
    handlers::{shoutbox, users},
};

/// Shoutbox and directory endpoints, nested under `/api`.
pub fn create_router_shoutbox() -> Router<Arc<AppState>> {
    Router::new()
        .route("/shoutbox/history", get(shoutbox::get_history))
        .route("/shoutbox/messages", post(shoutbox::post_message))
        .route("/shoutbox/messages/{id}", patch(shoutbox::edit_message))
        .route("/shoutbox/stream", get(shoutbox::stream))
        .route(
            "/shoutbox/sessions/{id}/heartbeat",
            post(shoutbox::heartbeat),
        )
        .route(
            "/shoutbox/sessions/{id}",
            axum::routing::delete(shoutbox::close_session),
        )
        .route("/shoutbox/online", get(shoutbox::online))
        .route("/shoutbox/settings", get(shoutbox::settings))
        .route("/users/{username}", get(users::get_user))
}
