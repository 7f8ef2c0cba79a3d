use std::{fmt, sync::Arc};

use shared::config::server::Config;

use crate::services::{
    directory::{SharedUserDirectory, StaticUserDirectory},
    fanout::Fanout,
    ingestion::IngestionPipeline,
    session_manager::{SessionManager, SharedSessionManager},
    store::{MemoryMessageStore, SharedMessageStore},
};

// Application state that will be shared across all routes
#[derive(Clone)]
pub struct AppState {
    pub(crate) pool: Option<sqlx::PgPool>,
    pub(crate) sessions: SharedSessionManager,
    pub(crate) directory: SharedUserDirectory,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("pool", &self.pool.is_some())
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Wires the fanout, ingestion pipeline, and session manager over the
    /// given store and directory.
    pub fn build(
        config: &Config,
        pool: Option<sqlx::PgPool>,
        store: SharedMessageStore,
        directory: SharedUserDirectory,
    ) -> Self {
        let fanout = Arc::new(Fanout::from_config(&config.fanout));
        let pipeline =
            IngestionPipeline::new(store, Arc::clone(&fanout), config.shoutbox.max_body_chars);
        let sessions = Arc::new(SessionManager::from_config(config, fanout, pipeline));
        Self {
            pool,
            sessions,
            directory,
        }
    }

    /// In-memory state with a configuration-backed directory.
    pub fn in_memory(config: &Config) -> Self {
        Self::build(
            config,
            None,
            Arc::new(MemoryMessageStore::new()),
            Arc::new(StaticUserDirectory::new(config.directory.avatars.clone())),
        )
    }
}
