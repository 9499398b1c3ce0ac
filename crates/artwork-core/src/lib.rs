//! Artwork Core - multi-resolution album artwork cache.
//!
//! Fetches cover art from a rate-limited upstream, keeps the original plus
//! fixed-size JPEG renditions on disk, and resolves URLs for page rendering
//! without ever blocking on the network. A resumable backfill job drives the
//! whole catalog through the same pipeline.
//!
//! # Example
//!
//! ```rust,ignore
//! use artwork_core::{ArtworkCache, ArtworkCacheConfig, SizeVariant, SqliteCatalog};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> artwork_core::Result<()> {
//!     let cache = ArtworkCache::builder(ArtworkCacheConfig::default())
//!         .catalog(Arc::new(SqliteCatalog::open("data/albums.db")?))
//!         .build()
//!         .await?;
//!
//!     // Immediate answer; a background refresh warms the cache
//!     let url = cache.resolve_url_sync(42, SizeVariant::Medium, None);
//!     println!("{} ({:?})", url.url, url.source);
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod error;
pub mod layout;
pub mod metadata;
pub mod migration;
pub mod mirror;
pub mod network;
pub mod pipeline;
pub mod resolver;
pub mod retention;

mod api;

// Re-export commonly used types
pub use api::{ArtworkCache, ArtworkCacheBuilder, ArtworkCacheStats};
pub use cache::{AssetIndex, AssetRecord, IndexStats, SqliteAssetIndex};
pub use cancel::CancellationToken;
pub use catalog::{AlbumCatalog, AlbumRecord, SqliteCatalog, StaticCatalog};
pub use config::{ArtworkCacheConfig, CropPolicy, SizeVariant};
pub use error::{ArtworkError, Result};
pub use layout::{CacheLayout, CacheStatistics};
pub use metadata::{MigrationProgress, MigrationReport, MigrationState};
pub use migration::{MigrationJob, MigrationStatus};
pub use mirror::{ArtworkUrlMirror, RemoteUrlSource, UrlSource};
pub use network::{ArtworkSource, FetchLimiter, FetchedArtwork, HttpArtworkSource, Priority};
pub use pipeline::FetchPipeline;
pub use resolver::{ArtworkResolver, ResolvedUrl, UrlOrigin};
pub use retention::{EvictOptions, EvictionDaemon, EvictionReport, Evictor, RetentionPolicy};
