//! # REST Handlers
//!
//! Read-only views over the running relay. Session control itself happens
//! over the websocket at `/ws`.

pub mod config;
pub mod sessions;

pub use config::get_config;
pub use sessions::{get_session, list_sessions};
