#![cfg_attr(not(test), forbid(unsafe_code))]
#![allow(clippy::multiple_crate_versions)]

//! Shared building blocks for the Shoutbox engine.
//!
//! The server and every client depend on the same wire models, the same
//! configuration surface, and the same reconciliation rules, so they live here.

pub mod config;
pub mod identity;
pub mod models;
pub mod reconcile;
