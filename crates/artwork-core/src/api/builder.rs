//! Builder for wiring an [`ArtworkCache`].

use std::sync::Arc;

use tracing::info;

use crate::api::{ArtworkCache, Components};
use crate::cache::{AssetIndex, SqliteAssetIndex};
use crate::catalog::AlbumCatalog;
use crate::config::ArtworkCacheConfig;
use crate::error::{ArtworkError, Result};
use crate::layout::CacheLayout;
use crate::metadata::ProgressStore;
use crate::migration::MigrationJob;
use crate::network::{ArtworkSource, FetchLimiter, HttpArtworkSource, RetryConfig};
use crate::pipeline::FetchPipeline;
use crate::resolver::ArtworkResolver;
use crate::retention::{Evictor, RetentionPolicy};

/// Builder for [`ArtworkCache`].
///
/// The catalog is required. The artwork source defaults to an HTTP client
/// built from the config, and the asset index to the SQLite database under
/// the cache root.
///
/// # Example
///
/// ```rust,ignore
/// let cache = ArtworkCache::builder(config)
///     .catalog(Arc::new(SqliteCatalog::open("albums.db")?))
///     .build()
///     .await?;
/// ```
pub struct ArtworkCacheBuilder {
    config: ArtworkCacheConfig,
    catalog: Option<Arc<dyn AlbumCatalog>>,
    source: Option<Arc<dyn ArtworkSource>>,
    index: Option<Arc<dyn AssetIndex>>,
    retry: Option<RetryConfig>,
}

impl ArtworkCacheBuilder {
    pub fn new(config: ArtworkCacheConfig) -> Self {
        Self {
            config,
            catalog: None,
            source: None,
            index: None,
            retry: None,
        }
    }

    /// The album store this cache reads from.
    pub fn catalog(mut self, catalog: Arc<dyn AlbumCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Replace the upstream artwork source.
    pub fn source(mut self, source: Arc<dyn ArtworkSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replace the asset index (e.g. an in-memory one).
    pub fn index(mut self, index: Arc<dyn AssetIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Override the retry policy derived from the config.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Build the cache. Must be called inside a tokio runtime, since the
    /// resolver spawns its refresh worker here.
    pub async fn build(self) -> Result<ArtworkCache> {
        let config = self.config;
        config.validate()?;

        let catalog = self.catalog.ok_or_else(|| ArtworkError::Config {
            message: "An album catalog is required".into(),
        })?;

        let layout = CacheLayout::new(&config.cache_root, config.url_prefix.clone());
        layout.repair()?;

        let index: Arc<dyn AssetIndex> = match self.index {
            Some(index) => index,
            None => Arc::new(SqliteAssetIndex::open(config.index_path())?),
        };
        let source: Arc<dyn ArtworkSource> = match self.source {
            Some(source) => source,
            None => Arc::new(HttpArtworkSource::from_config(&config)?),
        };
        let limiter = Arc::new(FetchLimiter::new(config.requests_per_second)?);

        let mut pipeline = FetchPipeline::new(
            &config,
            layout.clone(),
            index.clone(),
            source,
            limiter,
        );
        if let Some(retry) = self.retry {
            pipeline = pipeline.with_retry(retry);
        }
        let pipeline = Arc::new(pipeline);

        let resolver = Arc::new(ArtworkResolver::new(
            catalog.clone(),
            pipeline.clone(),
            &config,
        )?);
        let evictor = Arc::new(Evictor::new(
            layout,
            index,
            RetentionPolicy::from_config(&config),
        ));
        let migration = MigrationJob::new(
            catalog.clone(),
            pipeline.clone(),
            ProgressStore::new(&config.progress_file, &config.report_file),
            config.migration_concurrency,
        );

        info!(
            "Artwork cache ready at {} ({} req/s upstream)",
            config.cache_root.display(),
            config.requests_per_second
        );

        Ok(ArtworkCache::from_components(Components {
            config,
            catalog,
            pipeline,
            resolver,
            evictor,
            migration,
        }))
    }
}
