pub mod client;
pub mod messages;
pub mod sse;
pub mod tail;
pub mod whois;
