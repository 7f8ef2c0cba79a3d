//! Durable message storage.
//!
//! Both backends apply edits as a single conditional update keyed on
//! `(id, author, not deleted)`, so concurrent edits to one row serialize in the
//! store and the last accepted edit carries the highest revision.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::models::{Message, MessageId, Timestamp};
use sqlx::PgPool;
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{instrument, trace};

/// Storage failure. Always treated as transient by callers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Postgres returned an error or the pool was exhausted.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The backend is temporarily unable to serve requests.
    #[error("{0}")]
    Unavailable(String),
}

/// Result of a conditional edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    /// The row matched and now carries the new body.
    Updated(Message),
    /// No such message, or it was soft-deleted.
    NotFound,
    /// The message exists but belongs to someone else.
    NotAuthor,
}

/// Persisted-history collaborator.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Appends a message and returns it with its assigned id.
    async fn insert(&self, author: &str, body: &str) -> Result<Message, StoreError>;

    /// Replaces the body if `author` owns the live message `id`.
    async fn update_body(
        &self,
        id: MessageId,
        author: &str,
        body: &str,
    ) -> Result<EditOutcome, StoreError>;

    /// Newest-first page of visible messages older than `before`, plus
    /// whether more remain.
    async fn history(
        &self,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<(Vec<Message>, bool), StoreError>;
}

/// Shared handle to the configured store.
pub type SharedMessageStore = Arc<dyn MessageStore>;

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: i64,
    author: String,
    body: String,
    created_at: DateTime<Utc>,
    edited_at: Option<DateTime<Utc>>,
    revision: i64,
    is_deleted: bool,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            author: row.author,
            body: row.body,
            created_at: Timestamp(row.created_at),
            edited_at: row.edited_at.map(Timestamp),
            revision: row.revision,
            is_deleted: row.is_deleted,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OwnershipRow {
    author: String,
    is_deleted: bool,
}

/// Postgres-backed store over the `shoutbox_messages` table.
#[derive(Debug, Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    /// Wraps an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const MESSAGE_COLUMNS: &str = "id, author, body, created_at, edited_at, revision, is_deleted";

#[async_trait]
impl MessageStore for PgMessageStore {
    #[instrument(name = "store.insert", skip(self, body), err)]
    async fn insert(&self, author: &str, body: &str) -> Result<Message, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "INSERT INTO shoutbox_messages (author, body) VALUES ($1, $2) RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(author)
        .bind(body)
        .fetch_one(&self.pool)
        .await?;

        trace!(id = row.id, "message row inserted");
        Ok(row.into())
    }

    #[instrument(name = "store.update_body", skip(self, body), err)]
    async fn update_body(
        &self,
        id: MessageId,
        author: &str,
        body: &str,
    ) -> Result<EditOutcome, StoreError> {
        let updated = sqlx::query_as::<_, MessageRow>(&format!(
            "UPDATE shoutbox_messages \
             SET body = $3, edited_at = now(), revision = revision + 1 \
             WHERE id = $1 AND author = $2 AND NOT is_deleted \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(id)
        .bind(author)
        .bind(body)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Ok(EditOutcome::Updated(row.into()));
        }

        let owner = sqlx::query_as::<_, OwnershipRow>(
            "SELECT author, is_deleted FROM shoutbox_messages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match owner {
            Some(row) if !row.is_deleted && row.author != author => EditOutcome::NotAuthor,
            _ => EditOutcome::NotFound,
        })
    }

    #[instrument(name = "store.history", skip(self), err)]
    async fn history(
        &self,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<(Vec<Message>, bool), StoreError> {
        let fetch = i64::try_from(limit.saturating_add(1)).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM shoutbox_messages \
             WHERE NOT is_deleted AND ($1::BIGINT IS NULL OR id < $1) \
             ORDER BY id DESC LIMIT $2"
        ))
        .bind(before)
        .bind(fetch)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() > limit;
        let messages = rows.into_iter().take(limit).map(Message::from).collect();
        Ok((messages, has_more))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    last_id: MessageId,
    rows: BTreeMap<MessageId, Message>,
}

/// Process-local store used by the `memory` backend and in tests.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    state: Mutex<MemoryState>,
}

impl MemoryMessageStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryMessageStore {
    /// Soft-deletes a message. Returns whether a live row was removed.
    pub async fn soft_delete(&self, id: MessageId) -> bool {
        let mut state = self.state.lock().await;
        match state.rows.get_mut(&id) {
            Some(row) if !row.is_deleted => {
                row.is_deleted = true;
                row.revision += 1;
                true
            }
            _ => false,
        }
    }

    /// Current copy of a message, deleted or not.
    pub async fn get(&self, id: MessageId) -> Option<Message> {
        self.state.lock().await.rows.get(&id).cloned()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, author: &str, body: &str) -> Result<Message, StoreError> {
        let mut state = self.state.lock().await;
        state.last_id += 1;
        let message = Message {
            id: state.last_id,
            author: author.to_string(),
            body: body.to_string(),
            created_at: Timestamp::now(),
            edited_at: None,
            revision: 0,
            is_deleted: false,
        };
        state.rows.insert(message.id, message.clone());
        Ok(message)
    }

    async fn update_body(
        &self,
        id: MessageId,
        author: &str,
        body: &str,
    ) -> Result<EditOutcome, StoreError> {
        let mut state = self.state.lock().await;
        Ok(match state.rows.get_mut(&id) {
            None => EditOutcome::NotFound,
            Some(row) if row.is_deleted => EditOutcome::NotFound,
            Some(row) if row.author != author => EditOutcome::NotAuthor,
            Some(row) => {
                row.body = body.to_string();
                row.edited_at = Some(Timestamp::now());
                row.revision += 1;
                EditOutcome::Updated(row.clone())
            }
        })
    }

    async fn history(
        &self,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<(Vec<Message>, bool), StoreError> {
        let state = self.state.lock().await;
        let upper = before.unwrap_or(MessageId::MAX);
        let mut visible = state
            .rows
            .range(..upper)
            .rev()
            .map(|(_, message)| message)
            .filter(|message| !message.is_deleted);

        let messages: Vec<Message> = visible.by_ref().take(limit).cloned().collect();
        let has_more = visible.next().is_some();
        Ok((messages, has_more))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_unique_and_increasing() {
        let store = MemoryMessageStore::new();
        let first = store.insert("alice", "one").await.unwrap();
        let second = store.insert("bob", "two").await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.revision, 0);
    }

    #[tokio::test]
    async fn update_requires_the_author() {
        let store = MemoryMessageStore::new();
        let message = store.insert("alice", "hello").await.unwrap();

        let outcome = store
            .update_body(message.id, "bob", "hijacked")
            .await
            .unwrap();
        assert_eq!(outcome, EditOutcome::NotAuthor);
        assert_eq!(store.get(message.id).await.unwrap().body, "hello");

        let EditOutcome::Updated(updated) = store
            .update_body(message.id, "alice", "hello world")
            .await
            .unwrap()
        else {
            panic!("author edit should apply");
        };
        assert_eq!(updated.body, "hello world");
        assert_eq!(updated.revision, 1);
        assert!(updated.edited_at.is_some());
        assert_eq!(updated.created_at, message.created_at);
    }

    #[tokio::test]
    async fn missing_and_deleted_messages_are_not_found() {
        let store = MemoryMessageStore::new();
        assert_eq!(
            store.update_body(42, "alice", "x").await.unwrap(),
            EditOutcome::NotFound
        );

        let message = store.insert("alice", "hello").await.unwrap();
        assert!(store.soft_delete(message.id).await);
        assert_eq!(
            store.update_body(message.id, "alice", "x").await.unwrap(),
            EditOutcome::NotFound
        );
        assert_eq!(
            store.update_body(message.id, "bob", "x").await.unwrap(),
            EditOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn history_pages_newest_first_and_skips_deleted() {
        let store = MemoryMessageStore::new();
        for n in 1..=5 {
            store.insert("alice", &format!("m{n}")).await.unwrap();
        }
        store.soft_delete(4).await;

        let (page, has_more) = store.history(None, 2).await.unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![5, 3]);
        assert!(has_more);

        let (page, has_more) = store.history(Some(3), 10).await.unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2, 1]);
        assert!(!has_more);
    }

    #[tokio::test]
    async fn concurrent_edits_each_bump_the_revision() {
        let store = Arc::new(MemoryMessageStore::new());
        let message = store.insert("alice", "v0").await.unwrap();

        let handles: Vec<_> = (1..=8)
            .map(|n| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .update_body(message.id, "alice", &format!("v{n}"))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut revisions = Vec::new();
        for handle in handles {
            if let EditOutcome::Updated(updated) = handle.await.unwrap() {
                revisions.push(updated.revision);
            }
        }
        revisions.sort_unstable();
        assert_eq!(revisions, (1..=8).collect::<Vec<_>>());

        let last = store.get(message.id).await.unwrap();
        assert_eq!(last.revision, 8);
    }
}
