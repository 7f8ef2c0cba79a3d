use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{ErrorCode, Message};

/// Acknowledgement sent once a live session is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ConnectedEvent {
    /// Session id to use for heartbeats and error routing.
    pub session_id: Uuid,
    /// Fanout sequence at attach time.
    pub head_sequence: u64,
}

/// Batch of events missed between the caller's cursor and attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RecentMessagesEvent {
    /// Messages in publish order; a message edited twice appears twice.
    pub messages: Vec<Message>,
    /// Sequence of the last replayed event.
    pub through_sequence: u64,
}

/// Sent instead of a replay when the cursor can no longer be served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ResyncEvent {
    /// Why the replay was refused, e.g. `stale_cursor`.
    pub reason: String,
    /// Live delivery resumes after this sequence.
    pub head_sequence: u64,
}

/// Failure notice delivered only to the session that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct StreamErrorEvent {
    /// Failure category.
    pub code: ErrorCode,
    /// Human readable reason.
    pub message: String,
    /// Seconds to wait before retrying, for rate limit failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

/// Everything the live channel can carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type")]
pub enum ShoutboxEvent {
    /// Session attached.
    #[serde(rename = "connected")]
    Connected {
        /// Session details.
        payload: ConnectedEvent,
    },
    /// A new message was accepted.
    #[serde(rename = "message")]
    Message {
        /// The accepted message.
        payload: Message,
    },
    /// An existing message was edited.
    #[serde(rename = "messageUpdated")]
    MessageUpdated {
        /// The message with its new body and revision.
        payload: Message,
    },
    /// Replay of events published after the caller's cursor.
    #[serde(rename = "recentMessages")]
    RecentMessages {
        /// Replay batch.
        payload: RecentMessagesEvent,
    },
    /// The caller must re-fetch history before trusting the live stream.
    #[serde(rename = "resync")]
    Resync {
        /// Resync details.
        payload: ResyncEvent,
    },
    /// A submit or edit from this session failed.
    #[serde(rename = "error")]
    Error {
        /// Failure details.
        payload: StreamErrorEvent,
    },
}

impl ShoutboxEvent {
    /// SSE event name, identical to the serialized `type` tag.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Message { .. } => "message",
            Self::MessageUpdated { .. } => "messageUpdated",
            Self::RecentMessages { .. } => "recentMessages",
            Self::Resync { .. } => "resync",
            Self::Error { .. } => "error",
        }
    }

    /// Builds an error event.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>, retry_after_seconds: Option<u64>) -> Self {
        Self::Error {
            payload: StreamErrorEvent {
                code,
                message: message.into(),
                retry_after_seconds,
            },
        }
    }
}
