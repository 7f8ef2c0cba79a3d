use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Server settings clients need before rendering, served by
/// `GET /api/shoutbox/settings`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ShoutboxSettings {
    /// Longest accepted body, in Unicode scalar values.
    pub max_body_chars: usize,
    /// Largest history page the server returns.
    pub history_page_size: usize,
    /// Seconds between SSE keep-alives; clients heartbeat at this pace.
    pub heartbeat_seconds: u64,
    /// Avatar shown for users without one.
    pub default_avatar: String,
    /// How long a resolved avatar may be reused.
    pub avatar_ttl_seconds: u64,
}
