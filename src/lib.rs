//! Chunked upload assembly and live storage change notifications.

pub mod assembly;
pub mod changes;
pub mod chunk_store;
pub mod config;
pub mod error;
pub mod handlers;
pub mod janitor;
pub mod live;
pub mod middleware;
pub mod models;
pub mod retry;
pub mod server;
pub mod sessions;
pub mod state;
pub mod utils;
