//! Resolution service: the boundary between page rendering and the cache.
//!
//! Resolution never fails and never surfaces an error. The preference order
//! is a locally cached file, then the album's recorded cover URL, then the
//! caller's fallback or the placeholder.
//!
//! - [`ArtworkResolver::resolve_url_sync`] answers from what is already known
//!   and queues a background refresh when the cache is cold.
//! - [`ArtworkResolver::resolve_url`] runs `ensure` on a detached task and
//!   waits at most `resolve_timeout` for it. A caller that gives up does not
//!   cancel the work; it still lands in the cache for the next request.

use crate::catalog::{AlbumCatalog, AlbumRecord};
use crate::config::{ArtworkCacheConfig, CacheDefaults, SizeVariant};
use crate::error::{ArtworkError, Result};
use crate::network::Priority;
use crate::pipeline::FetchPipeline;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Where a resolved URL points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlOrigin {
    /// A file in the local cache.
    Cache,
    /// The album's recorded external cover URL.
    External,
    /// The caller's fallback, or the configured placeholder.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedUrl {
    pub url: String,
    pub source: UrlOrigin,
}

/// Counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStats {
    pub cache_hits: u64,
    pub external_fallbacks: u64,
    pub placeholders: u64,
    pub refreshes_scheduled: u64,
    pub refreshes_dropped: u64,
    pub timeouts: u64,
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    external_fallbacks: AtomicU64,
    placeholders: AtomicU64,
    refreshes_scheduled: AtomicU64,
    refreshes_dropped: AtomicU64,
    timeouts: AtomicU64,
}

impl Counters {
    fn count(&self, resolved: &ResolvedUrl) {
        let counter = match resolved.source {
            UrlOrigin::Cache => &self.cache_hits,
            UrlOrigin::External => &self.external_fallbacks,
            UrlOrigin::Placeholder => &self.placeholders,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ResolverStats {
        ResolverStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            external_fallbacks: self.external_fallbacks.load(Ordering::Relaxed),
            placeholders: self.placeholders.load(Ordering::Relaxed),
            refreshes_scheduled: self.refreshes_scheduled.load(Ordering::Relaxed),
            refreshes_dropped: self.refreshes_dropped.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

type RefreshKey = (i64, SizeVariant);

pub struct ArtworkResolver {
    catalog: Arc<dyn AlbumCatalog>,
    pipeline: Arc<FetchPipeline>,
    placeholder_url: String,
    resolve_timeout: Duration,
    refresh_tx: mpsc::Sender<RefreshKey>,
    pending: Arc<Mutex<HashSet<RefreshKey>>>,
    counters: Arc<Counters>,
}

impl ArtworkResolver {
    /// Create the resolver and spawn its refresh worker on the current
    /// tokio runtime. The worker stops when the resolver is dropped.
    pub fn new(
        catalog: Arc<dyn AlbumCatalog>,
        pipeline: Arc<FetchPipeline>,
        config: &ArtworkCacheConfig,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| ArtworkError::Config {
            message: format!("Artwork resolver needs a tokio runtime: {}", e),
        })?;

        let (refresh_tx, refresh_rx) = mpsc::channel(CacheDefaults::REFRESH_QUEUE_CAPACITY);
        let pending = Arc::new(Mutex::new(HashSet::new()));
        let counters = Arc::new(Counters::default());

        runtime.spawn(refresh_worker(
            refresh_rx,
            catalog.clone(),
            pipeline.clone(),
            pending.clone(),
        ));

        Ok(Self {
            catalog,
            pipeline,
            placeholder_url: config.placeholder_url.clone(),
            resolve_timeout: config.resolve_timeout,
            refresh_tx,
            pending,
            counters,
        })
    }

    pub fn pipeline(&self) -> &Arc<FetchPipeline> {
        &self.pipeline
    }

    pub fn stats(&self) -> ResolverStats {
        self.counters.snapshot()
    }

    /// Best immediately known URL. Never waits on the network.
    ///
    /// On a cache miss a background refresh is queued; if the queue is full
    /// the refresh is dropped and the next request tries again.
    pub fn resolve_url_sync(&self, album_id: i64, size: SizeVariant, fallback: Option<&str>) -> ResolvedUrl {
        let album = self.album(album_id);

        if let Some(album) = &album {
            if let Some(url) = self.cached_url(album, size) {
                return self.finish(url);
            }
            if album.source_reference().is_some() {
                self.schedule_refresh(album_id, size);
            }
        }

        self.finish(self.fallback(album.as_ref(), fallback))
    }

    /// Full resolution: ensures the variant if the cache is cold, waiting up
    /// to the resolve timeout. Any failure degrades to the fallback chain.
    pub async fn resolve_url(&self, album_id: i64, size: SizeVariant, fallback: Option<&str>) -> ResolvedUrl {
        let Some(album) = self.album(album_id) else {
            return self.finish(self.fallback(None, fallback));
        };
        if let Some(url) = self.cached_url(&album, size) {
            return self.finish(url);
        }

        let pipeline = self.pipeline.clone();
        let target = album.clone();
        // Detached: dropping the handle on timeout leaves the work running
        let task = tokio::spawn(async move { pipeline.ensure(&target, size, Priority::Live).await });

        match tokio::time::timeout(self.resolve_timeout, task).await {
            Ok(Ok(Ok(record))) => {
                return self.finish(ResolvedUrl {
                    url: self.pipeline.asset_url(&record),
                    source: UrlOrigin::Cache,
                })
            }
            Ok(Ok(Err(e))) => debug!("Artwork resolution for album {} fell back: {}", album_id, e),
            Ok(Err(e)) => warn!("Artwork resolution task for album {} failed: {}", album_id, e),
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Artwork resolution for album {} timed out after {:?}; continuing in background",
                    album_id, self.resolve_timeout
                );
            }
        }

        self.finish(self.fallback(Some(&album), fallback))
    }

    fn album(&self, album_id: i64) -> Option<AlbumRecord> {
        match self.catalog.get_album(album_id) {
            Ok(album) => album,
            Err(e) => {
                warn!("Album lookup failed for {}: {}", album_id, e);
                None
            }
        }
    }

    fn cached_url(&self, album: &AlbumRecord, size: SizeVariant) -> Option<ResolvedUrl> {
        match self.pipeline.lookup(album, size) {
            Ok(Some(record)) => Some(ResolvedUrl {
                url: self.pipeline.asset_url(&record),
                source: UrlOrigin::Cache,
            }),
            Ok(None) => None,
            Err(e) => {
                warn!("Artwork index lookup failed for album {}: {}", album.id, e);
                None
            }
        }
    }

    /// Recorded cover URL, else the caller's fallback, else the placeholder.
    /// The caller's fallback stands in for the placeholder, so it never
    /// outranks a recorded URL.
    fn fallback(&self, album: Option<&AlbumRecord>, fallback: Option<&str>) -> ResolvedUrl {
        if let Some(url) = album.and_then(|a| a.recorded_cover_url()) {
            return ResolvedUrl {
                url: url.to_string(),
                source: UrlOrigin::External,
            };
        }
        let url = fallback
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or(&self.placeholder_url)
            .to_string();
        ResolvedUrl {
            url,
            source: UrlOrigin::Placeholder,
        }
    }

    fn finish(&self, resolved: ResolvedUrl) -> ResolvedUrl {
        self.counters.count(&resolved);
        resolved
    }

    fn schedule_refresh(&self, album_id: i64, size: SizeVariant) {
        let key = (album_id, size);
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        if !pending.insert(key) {
            return;
        }
        match self.refresh_tx.try_send(key) {
            Ok(()) => {
                self.counters.refreshes_scheduled.fetch_add(1, Ordering::Relaxed);
                debug!("Scheduled artwork refresh for album {} ({})", album_id, size);
            }
            Err(_) => {
                pending.remove(&key);
                self.counters.refreshes_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Refresh queue full; dropped album {} ({})", album_id, size);
            }
        }
    }
}

async fn refresh_worker(
    mut rx: mpsc::Receiver<RefreshKey>,
    catalog: Arc<dyn AlbumCatalog>,
    pipeline: Arc<FetchPipeline>,
    pending: Arc<Mutex<HashSet<RefreshKey>>>,
) {
    while let Some((album_id, size)) = rx.recv().await {
        match catalog.get_album(album_id) {
            Ok(Some(album)) => {
                // Errors are already logged by the pipeline
                let _ = pipeline.ensure(&album, size, Priority::Live).await;
            }
            Ok(None) => debug!("Album {} vanished before refresh", album_id),
            Err(e) => warn!("Album lookup failed during refresh of {}: {}", album_id, e),
        }
        if let Ok(mut pending) = pending.lock() {
            pending.remove(&(album_id, size));
        }
    }
    debug!("Artwork refresh worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteAssetIndex;
    use crate::catalog::StaticCatalog;
    use crate::layout::CacheLayout;
    use crate::network::{ArtworkSource, FetchLimiter, FetchedArtwork};
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct SlowSource {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ArtworkSource for SlowSource {
        async fn fetch(&self, _album_id: i64, _url: &str) -> Result<FetchedArtwork> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let mut buf = Cursor::new(Vec::new());
            image::DynamicImage::new_rgb8(32, 32)
                .write_to(&mut buf, image::ImageFormat::Png)
                .unwrap();
            Ok(FetchedArtwork {
                bytes: buf.into_inner(),
                content_type: None,
            })
        }
    }

    fn resolver(dir: &TempDir, delay: Duration, timeout: Duration) -> (ArtworkResolver, Arc<SlowSource>) {
        let mut config = ArtworkCacheConfig::with_root(dir.path());
        config.resolve_timeout = timeout;
        let layout = CacheLayout::new(dir.path(), "/static/artwork_cache");
        layout.ensure_directories().unwrap();
        let source = Arc::new(SlowSource {
            delay,
            calls: AtomicUsize::new(0),
        });
        let pipeline = Arc::new(FetchPipeline::new(
            &config,
            layout,
            Arc::new(SqliteAssetIndex::in_memory().unwrap()),
            source.clone(),
            Arc::new(FetchLimiter::new(1000.0).unwrap()),
        ));
        let catalog = Arc::new(StaticCatalog::new([
            AlbumRecord::new(1).with_cover_url("https://img.example.org/1.png"),
            AlbumRecord::new(2).with_musicbrainz_id("mb-2"),
            AlbumRecord::new(3),
        ]));
        (ArtworkResolver::new(catalog, pipeline, &config).unwrap(), source)
    }

    #[tokio::test]
    async fn test_sync_fallback_chain() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _) = resolver(&temp_dir, Duration::ZERO, Duration::from_secs(5));

        let recorded = resolver.resolve_url_sync(1, SizeVariant::Medium, None);
        assert_eq!(recorded.source, UrlOrigin::External);
        assert_eq!(recorded.url, "https://img.example.org/1.png");

        let recorded_wins = resolver.resolve_url_sync(1, SizeVariant::Medium, Some("/static/img/custom.svg"));
        assert_eq!(recorded_wins, recorded);

        let explicit = resolver.resolve_url_sync(2, SizeVariant::Medium, Some("/static/img/custom.svg"));
        assert_eq!(explicit.url, "/static/img/custom.svg");
        assert_eq!(explicit.source, UrlOrigin::Placeholder);

        let placeholder = resolver.resolve_url_sync(3, SizeVariant::Medium, None);
        assert_eq!(placeholder.source, UrlOrigin::Placeholder);
        assert_eq!(placeholder.url, CacheDefaults::PLACEHOLDER_URL);

        let unknown = resolver.resolve_url_sync(404, SizeVariant::Small, None);
        assert_eq!(unknown.source, UrlOrigin::Placeholder);
    }

    #[tokio::test]
    async fn test_async_resolution_returns_cached_url() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, source) = resolver(&temp_dir, Duration::ZERO, Duration::from_secs(5));

        let first = resolver.resolve_url(1, SizeVariant::Large, None).await;
        assert_eq!(first.source, UrlOrigin::Cache);
        assert!(first.url.starts_with("/static/artwork_cache/large/"));
        assert!(first.url.ends_with(".jpg"));

        let second = resolver.resolve_url(1, SizeVariant::Large, None).await;
        assert_eq!(first, second);
        assert_eq!(resolver.resolve_url_sync(1, SizeVariant::Large, None), first);
        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_degrades_but_work_completes() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _) = resolver(
            &temp_dir,
            Duration::from_millis(300),
            Duration::from_millis(20),
        );

        let quick = resolver.resolve_url(1, SizeVariant::Small, None).await;
        assert_eq!(quick.source, UrlOrigin::External);
        assert_eq!(resolver.stats().timeouts, 1);

        tokio::time::sleep(Duration::from_millis(800)).await;
        let later = resolver.resolve_url_sync(1, SizeVariant::Small, None);
        assert_eq!(later.source, UrlOrigin::Cache);
    }

    #[tokio::test]
    async fn test_sync_refresh_is_deduplicated() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, source) = resolver(
            &temp_dir,
            Duration::from_millis(100),
            Duration::from_secs(5),
        );

        for _ in 0..5 {
            resolver.resolve_url_sync(2, SizeVariant::Thumbnail, None);
        }
        assert_eq!(resolver.stats().refreshes_scheduled, 1);

        // Albums without any reference are never queued
        resolver.resolve_url_sync(3, SizeVariant::Thumbnail, None);
        assert_eq!(resolver.stats().refreshes_scheduled, 1);

        for _ in 0..100 {
            if resolver.resolve_url_sync(2, SizeVariant::Thumbnail, None).source == UrlOrigin::Cache {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            resolver.resolve_url_sync(2, SizeVariant::Thumbnail, None).source,
            UrlOrigin::Cache
        );
        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
