use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Public profile returned by `GET /api/users/{username}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UserProfile {
    /// Login name, also the message author key.
    pub username: String,
    /// Avatar reference; absent when the user never set one.
    #[serde(default)]
    pub avatar_url: Option<String>,
}
