use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
};
use shared::{identity::IdentityLookup, models::UserProfile};
use tracing::{instrument, warn};

use crate::{
    app_state::AppState,
    http::{
        error::{ApiError, AppResult},
        extract::ApiPath,
        problem::ProblemDetails,
    },
};

#[utoipa::path(
    get,
    path = "/api/users/{username}",
    params(("username" = String, Path, description = "Platform username")),
    responses(
        (status = 200, description = "Public profile", body = UserProfile),
        (status = 404, description = "Unknown user", body = ProblemDetails),
        (status = 503, description = "Directory unavailable", body = ProblemDetails)
    ),
    tag = "Users"
)]
#[instrument(skip(state))]
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    ApiPath(username): ApiPath<String>,
) -> AppResult<Json<UserProfile>> {
    match state.directory.lookup(&username).await {
        Ok(Some(profile)) => Ok(Json(profile)),
        Ok(None) => Err(ApiError::not_found(format!("user {username} not found"))),
        Err(err) => {
            warn!(error = %err, "user directory lookup failed");
            Err(ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "transient_io",
                "user directory is temporarily unavailable; please retry",
            ))
        }
    }
}
