//! The assembled artwork cache.
//!
//! [`ArtworkCache`] wires the layout, asset index, fetch pipeline, resolver,
//! evictor and migration job around one shared rate limiter. Callers that need
//! finer control can reach each component through its accessor.

mod builder;

pub use builder::ArtworkCacheBuilder;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::cache::{AssetRecord, IndexStats};
use crate::catalog::{AlbumCatalog, AlbumRecord};
use crate::config::{ArtworkCacheConfig, SizeVariant};
use crate::error::{ArtworkError, Result};
use crate::layout::{CacheLayout, CacheStatistics};
use crate::migration::MigrationJob;
use crate::network::{LimiterStats, Priority};
use crate::pipeline::{FetchPipeline, PipelineStats};
use crate::resolver::{ArtworkResolver, ResolvedUrl, ResolverStats};
use crate::retention::{EvictOptions, EvictionDaemon, EvictionReport, Evictor};

/// Combined statistics, as served by `/stats` and the `stats` command.
#[derive(Debug, Clone, Serialize)]
pub struct ArtworkCacheStats {
    pub disk: CacheStatistics,
    pub index: IndexStats,
    pub pipeline: PipelineStats,
    pub resolver: ResolverStats,
    pub limiter: LimiterStats,
}

pub(crate) struct Components {
    pub config: ArtworkCacheConfig,
    pub catalog: Arc<dyn AlbumCatalog>,
    pub pipeline: Arc<FetchPipeline>,
    pub resolver: Arc<ArtworkResolver>,
    pub evictor: Arc<Evictor>,
    pub migration: MigrationJob,
}

pub struct ArtworkCache {
    config: ArtworkCacheConfig,
    catalog: Arc<dyn AlbumCatalog>,
    pipeline: Arc<FetchPipeline>,
    resolver: Arc<ArtworkResolver>,
    evictor: Arc<Evictor>,
    migration: MigrationJob,
}

impl ArtworkCache {
    pub fn builder(config: ArtworkCacheConfig) -> ArtworkCacheBuilder {
        ArtworkCacheBuilder::new(config)
    }

    pub(crate) fn from_components(parts: Components) -> Self {
        Self {
            config: parts.config,
            catalog: parts.catalog,
            pipeline: parts.pipeline,
            resolver: parts.resolver,
            evictor: parts.evictor,
            migration: parts.migration,
        }
    }

    pub fn config(&self) -> &ArtworkCacheConfig {
        &self.config
    }

    pub fn layout(&self) -> &CacheLayout {
        self.pipeline.layout()
    }

    pub fn pipeline(&self) -> &Arc<FetchPipeline> {
        &self.pipeline
    }

    pub fn resolver(&self) -> &Arc<ArtworkResolver> {
        &self.resolver
    }

    pub fn evictor(&self) -> &Arc<Evictor> {
        &self.evictor
    }

    pub fn migration(&self) -> &MigrationJob {
        &self.migration
    }

    fn album(&self, album_id: i64) -> Result<AlbumRecord> {
        self.catalog
            .get_album(album_id)?
            .ok_or(ArtworkError::AlbumNotFound { album_id })
    }

    /// Ensure one variant of an album is cached, at live priority.
    pub async fn ensure(&self, album_id: i64, size: SizeVariant) -> Result<AssetRecord> {
        let album = self.album(album_id)?;
        self.pipeline.ensure(&album, size, Priority::Live).await
    }

    /// Ensure the original and all derived variants of an album.
    pub async fn ensure_all(&self, album_id: i64) -> Result<Vec<AssetRecord>> {
        let album = self.album(album_id)?;
        self.pipeline.ensure_all(&album, Priority::Live).await
    }

    pub fn resolve_url_sync(
        &self,
        album_id: i64,
        size: SizeVariant,
        fallback: Option<&str>,
    ) -> ResolvedUrl {
        self.resolver.resolve_url_sync(album_id, size, fallback)
    }

    pub async fn resolve_url(
        &self,
        album_id: i64,
        size: SizeVariant,
        fallback: Option<&str>,
    ) -> ResolvedUrl {
        self.resolver.resolve_url(album_id, size, fallback).await
    }

    /// Run one eviction sweep now. Blocking; call from a blocking context.
    pub fn evict(&self, options: EvictOptions) -> Result<EvictionReport> {
        self.evictor.evict_with(Utc::now(), options)
    }

    /// Remove every cached file and index row for an album.
    pub fn purge_album(&self, album_id: i64) -> Result<EvictionReport> {
        self.evictor.purge_album(album_id)
    }

    /// Start periodic eviction at the configured interval.
    pub fn start_eviction_daemon(&self) -> EvictionDaemon {
        EvictionDaemon::start(self.evictor.clone(), self.config.eviction_interval)
    }

    pub fn verify_structure(&self) -> Vec<String> {
        self.layout().verify_structure()
    }

    pub fn stats(&self) -> Result<ArtworkCacheStats> {
        Ok(ArtworkCacheStats {
            disk: self.layout().statistics(),
            index: self.pipeline.index().stats()?,
            pipeline: self.pipeline.stats(),
            resolver: self.resolver.stats(),
            limiter: self.pipeline.limiter().stats(),
        })
    }
}
