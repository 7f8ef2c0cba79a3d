use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use shared::{
    identity::{IdentityError, IdentityLookup},
    models::UserProfile,
};
use sqlx::PgPool;
use tracing::instrument;

/// Shared handle to the configured user directory.
pub type SharedUserDirectory = Arc<dyn IdentityLookup>;

/// Reads profiles from the platform's `users` table.
#[derive(Debug, Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    /// Wraps an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    username: String,
    avatar_url: Option<String>,
}

#[async_trait]
impl IdentityLookup for PgUserDirectory {
    #[instrument(name = "directory.lookup", skip(self), err)]
    async fn lookup(&self, username: &str) -> Result<Option<UserProfile>, IdentityError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT username, avatar_url FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| IdentityError::Lookup(err.to_string()))?;

        Ok(row.map(|row| UserProfile {
            username: row.username,
            avatar_url: row.avatar_url,
        }))
    }
}

/// Read-only directory built from configuration at startup. Every username
/// is known; only those listed carry an avatar.
#[derive(Debug, Clone, Default)]
pub struct StaticUserDirectory {
    avatars: BTreeMap<String, String>,
}

impl StaticUserDirectory {
    /// Creates a directory from a `username -> avatar` map.
    #[must_use]
    pub const fn new(avatars: BTreeMap<String, String>) -> Self {
        Self { avatars }
    }
}

#[async_trait]
impl IdentityLookup for StaticUserDirectory {
    async fn lookup(&self, username: &str) -> Result<Option<UserProfile>, IdentityError> {
        if username.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(UserProfile {
            username: username.to_string(),
            avatar_url: self.avatars.get(username).cloned(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_directory_knows_configured_avatars() {
        let directory = StaticUserDirectory::new(BTreeMap::from([(
            "alice".to_string(),
            "/avatars/alice.png".to_string(),
        )]));

        let alice = directory.lookup("alice").await.unwrap().unwrap();
        assert_eq!(alice.avatar_url.as_deref(), Some("/avatars/alice.png"));

        let bob = directory.lookup("bob").await.unwrap().unwrap();
        assert_eq!(bob.avatar_url, None);

        assert!(directory.lookup(" ").await.unwrap().is_none());
    }
}
