pub mod directory;
pub mod error;
pub mod fanout;
pub mod ingestion;
pub mod rate_limiter;
pub mod session_manager;
pub mod store;
