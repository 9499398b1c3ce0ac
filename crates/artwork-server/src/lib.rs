//! Artwork server - HTTP surface over the artwork cache.
//!
//! Exposes URL resolution for the page renderer, cache statistics, and
//! static serving of cached files. The `artwork-cache` binary wraps this
//! together with the operator commands.

pub mod handler;
pub mod server;

pub use server::{build_router, start_server, AppState};
