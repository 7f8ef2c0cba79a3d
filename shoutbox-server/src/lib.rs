#![cfg_attr(not(test), forbid(unsafe_code))]
#![allow(clippy::multiple_crate_versions)]

//! Shoutbox server: accepts messages over REST, persists them, and fans them
//! out in order to every live SSE session.

pub mod app_state;
mod db;
mod handlers;
mod http;
mod middleware;
pub mod openapi;
mod routes;
pub mod server;
pub mod services;
mod tracer;
