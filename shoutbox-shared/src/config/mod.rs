//! # Configuration
//!
//! Server configuration, profile defaults, and the loading pipeline
//! (file, environment, command-line overrides).

pub mod server;
