//! Username to avatar resolution with a time-bounded cache.
//!
//! Lookups never fail from the caller's point of view: unknown users and
//! users without an avatar resolve to the configured default, and transport
//! failures fall back to the default without poisoning the cache.

use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, warn};

use crate::models::UserProfile;

/// Failure of the underlying identity source.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The source could not be reached or answered with an unexpected status.
    #[error("identity lookup failed: {0}")]
    Lookup(String),
}

/// Source of user profiles, keyed by username.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// Returns the profile, `Ok(None)` when the user does not exist.
    async fn lookup(&self, username: &str) -> Result<Option<UserProfile>, IdentityError>;
}

#[async_trait]
impl<T: IdentityLookup + ?Sized> IdentityLookup for Arc<T> {
    async fn lookup(&self, username: &str) -> Result<Option<UserProfile>, IdentityError> {
        (**self).lookup(username).await
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    avatar: String,
    fetched_at: Instant,
}

/// Caching avatar resolver in front of an [`IdentityLookup`].
#[derive(Debug)]
pub struct AvatarCache<L> {
    lookup: L,
    default_avatar: String,
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl<L: IdentityLookup> AvatarCache<L> {
    /// Creates an empty cache.
    pub fn new(lookup: L, default_avatar: impl Into<String>, ttl: Duration) -> Self {
        Self {
            lookup,
            default_avatar: default_avatar.into(),
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves the avatar for `username`, consulting the source when the
    /// cached value is missing or older than the TTL.
    pub async fn resolve(&self, username: &str) -> String {
        if let Some(avatar) = self.fresh(username).await {
            return avatar;
        }

        match self.lookup.lookup(username).await {
            Ok(profile) => {
                let avatar = profile
                    .and_then(|profile| profile.avatar_url)
                    .filter(|url| !url.trim().is_empty())
                    .unwrap_or_else(|| self.default_avatar.clone());
                self.entries.write().await.insert(
                    username.to_string(),
                    CacheEntry {
                        avatar: avatar.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                debug!(username, avatar = %avatar, "avatar resolved");
                avatar
            }
            Err(err) => {
                warn!(username, error = %err, "avatar lookup failed; using default");
                self.default_avatar.clone()
            }
        }
    }

    /// Returns a fresh cached avatar without waiting on the lock or the source.
    pub fn peek(&self, username: &str) -> Option<String> {
        let entries = self.entries.try_read().ok()?;
        entries
            .get(username)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.avatar.clone())
    }

    async fn fresh(&self, username: &str) -> Option<String> {
        let entries = self.entries.read().await;
        entries
            .get(username)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.avatar.clone())
    }
}
