//! Upstream artwork fetching.
//!
//! This module provides:
//! - The `ArtworkSource` seam and its reqwest implementation
//! - Retry logic with exponential backoff and jitter
//! - The shared, live-prioritized upstream rate limiter

mod limiter;
mod retry;
mod source;

pub use limiter::{FetchLimiter, LimiterStats, Priority};
pub use retry::{retry_async, RetryConfig, RetryStats};
pub use source::{ArtworkSource, FetchedArtwork, HttpArtworkSource};
