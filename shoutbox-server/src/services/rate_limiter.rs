use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use shared::config::server::RateLimitConfig;
use tokio::{sync::Mutex, time::Instant};

/// Decision for a single submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOutcome {
    /// The attempt was counted and may proceed.
    Allowed {
        /// Attempts left in the current window.
        remaining: u32,
    },
    /// The window is full.
    Denied {
        /// Seconds until the oldest counted attempt leaves the window.
        retry_after: u64,
    },
}

/// Sliding-window log keyed by identity. Windows outlive sessions, so
/// reconnecting does not reset a sender's budget.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    log: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Allows `limit` attempts per `window` for each identity.
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            log: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a limiter from configuration.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.messages_per_window, config.window())
    }

    /// Counts an attempt for `identity` if the window has room.
    pub async fn acquire(&self, identity: &str) -> RateLimitOutcome {
        let now = Instant::now();
        let mut log = self.log.lock().await;
        let attempts = log.entry(identity.to_string()).or_default();

        while attempts
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= self.window)
        {
            attempts.pop_front();
        }

        let used = u32::try_from(attempts.len()).unwrap_or(u32::MAX);
        if used >= self.limit {
            let oldest = attempts.front().copied().unwrap_or(now);
            let wait = self
                .window
                .saturating_sub(now.saturating_duration_since(oldest));
            let retry_after = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            return RateLimitOutcome::Denied {
                retry_after: retry_after.max(1),
            };
        }

        attempts.push_back(now);
        RateLimitOutcome::Allowed {
            remaining: self.limit - used - 1,
        }
    }

    /// Forgets identities whose window is empty. Returns how many were removed.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let mut log = self.log.lock().await;
        let before = log.len();
        log.retain(|_, attempts| {
            attempts
                .back()
                .is_some_and(|at| now.saturating_duration_since(*at) < self.window)
        });
        before - log.len()
    }
}
