use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::Timestamp;

/// Store-assigned message identifier. Strictly increasing in acceptance order.
pub type MessageId = i64;

/// A single shoutbox entry as persisted and broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Message {
    /// Unique id, also the ordering and deduplication key.
    pub id: MessageId,
    /// Username of the sender; never changes.
    pub author: String,
    /// Current body text.
    pub body: String,
    /// Instant the server accepted the message.
    pub created_at: Timestamp,
    /// Instant of the latest accepted edit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<Timestamp>,
    /// Edit counter; a higher revision always supersedes a lower one.
    #[serde(default)]
    pub revision: i64,
    /// Soft-deleted messages are hidden from views and cannot be edited.
    #[serde(default)]
    pub is_deleted: bool,
}

impl Message {
    /// Whether the message has been edited at least once.
    #[must_use]
    pub const fn is_edited(&self) -> bool {
        self.revision > 0
    }
}

/// Body of `POST /api/shoutbox/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SubmitMessageRequest {
    /// Message text.
    pub body: String,
}

/// Body of `PATCH /api/shoutbox/messages/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EditMessageRequest {
    /// Replacement text.
    pub body: String,
}

/// Query parameters of `GET /api/shoutbox/history`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery {
    /// Maximum number of messages to return.
    pub limit: Option<usize>,
    /// Only return messages with an id lower than this one.
    pub before: Option<MessageId>,
}

/// A newest-first page of durable history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct HistoryPage {
    /// Messages, newest first.
    pub messages: Vec<Message>,
    /// Fanout sequence observed before the page was read. Attach with this
    /// value to receive everything published after the snapshot.
    pub cursor: u64,
    /// Whether older messages exist beyond this page.
    pub has_more: bool,
}

/// Identities with an attached live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OnlineResponse {
    /// Usernames, sorted.
    pub users: Vec<String>,
    /// Attached sessions without an identity.
    pub anonymous: usize,
}
