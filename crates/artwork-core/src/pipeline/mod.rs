//! Fetch & derive pipeline.
//!
//! `ensure` makes one (album, size) variant present on disk and indexed:
//! 1. Reuse the indexed file if its cache key is current and the file exists
//! 2. Refuse early if the source reference is negatively cached
//! 3. Fetch the original under the shared limiter, with retries
//! 4. Validate, persist the original unmodified, then render derived variants
//!
//! Every file lands via temp file + rename, so a file under its final name is
//! always complete. Work on one (album, size) is serialized by a per-key lock;
//! a derived variant's lock is always taken before its original's.

mod derive;

pub use derive::{fit, ImageInfo};

use crate::cache::{AssetIndex, AssetRecord, NegativeEntry, NegativeKind};
use crate::catalog::AlbumRecord;
use crate::config::{ArtworkCacheConfig, CropPolicy, SizeVariant};
use crate::error::{ArtworkError, Result};
use crate::layout::{CacheLayout, DERIVED_EXTENSION};
use crate::metadata::atomic_write_bytes;
use crate::network::{retry_async, ArtworkSource, FetchLimiter, Priority, RetryConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

type KeyLock = Arc<AsyncMutex<()>>;

/// Per-(album, size) write locks. Entries are dropped once unused.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<(i64, SizeVariant), Weak<AsyncMutex<()>>>>,
}

impl KeyLocks {
    const PRUNE_THRESHOLD: usize = 1024;

    async fn lock(&self, album_id: i64, size: SizeVariant) -> Result<OwnedMutexGuard<()>> {
        let lock: KeyLock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|e| ArtworkError::Other(format!("Key lock table poisoned: {}", e)))?;
            if locks.len() > Self::PRUNE_THRESHOLD {
                locks.retain(|_, weak| weak.strong_count() > 0);
            }
            match locks.get(&(album_id, size)).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    let created = Arc::new(AsyncMutex::new(()));
                    locks.insert((album_id, size), Arc::downgrade(&created));
                    created
                }
            }
        };
        Ok(lock.lock_owned().await)
    }
}

/// Counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub cache_hits: u64,
    pub upstream_requests: u64,
    pub originals_fetched: u64,
    pub variants_derived: u64,
    pub negative_hits: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    upstream_requests: AtomicU64,
    originals_fetched: AtomicU64,
    variants_derived: AtomicU64,
    negative_hits: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            upstream_requests: self.upstream_requests.load(Ordering::Relaxed),
            originals_fetched: self.originals_fetched.load(Ordering::Relaxed),
            variants_derived: self.variants_derived.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Fetches originals and renders derived variants into the cache.
pub struct FetchPipeline {
    layout: CacheLayout,
    index: Arc<dyn AssetIndex>,
    source: Arc<dyn ArtworkSource>,
    limiter: Arc<FetchLimiter>,
    retry: RetryConfig,
    crop_policy: CropPolicy,
    negative_ttl: Duration,
    malformed_ttl: Duration,
    locks: KeyLocks,
    counters: Counters,
}

impl FetchPipeline {
    pub fn new(
        config: &ArtworkCacheConfig,
        layout: CacheLayout,
        index: Arc<dyn AssetIndex>,
        source: Arc<dyn ArtworkSource>,
        limiter: Arc<FetchLimiter>,
    ) -> Self {
        Self {
            layout,
            index,
            source,
            limiter,
            retry: RetryConfig::from_config(config),
            crop_policy: config.crop_policy,
            negative_ttl: config.negative_ttl,
            malformed_ttl: config.malformed_ttl,
            locks: KeyLocks::default(),
            counters: Counters::default(),
        }
    }

    /// Replace the retry policy; tests use this to drop backoff delays.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn index(&self) -> &Arc<dyn AssetIndex> {
        &self.index
    }

    pub fn limiter(&self) -> &Arc<FetchLimiter> {
        &self.limiter
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    pub fn asset_path(&self, record: &AssetRecord) -> PathBuf {
        self.layout
            .path(record.size_variant, &record.cache_key, &record.file_extension)
    }

    pub fn asset_url(&self, record: &AssetRecord) -> String {
        self.layout
            .url(record.size_variant, &record.cache_key, &record.file_extension)
    }

    /// The indexed asset for (album, size) if it is current and on disk.
    /// Touches it on success. Never fetches.
    pub fn lookup(&self, album: &AlbumRecord, size: SizeVariant) -> Result<Option<AssetRecord>> {
        let Some(key) = CacheLayout::key_for(album) else {
            return Ok(None);
        };
        self.current_asset(album.id, size, &key)
    }

    /// Ensure one variant is cached, fetching and deriving as needed.
    pub async fn ensure(
        &self,
        album: &AlbumRecord,
        size: SizeVariant,
        priority: Priority,
    ) -> Result<AssetRecord> {
        let result = self.ensure_variant(album, size, priority).await;
        if let Err(e) = &result {
            self.note_failure(album.id, size, e);
        }
        result
    }

    async fn ensure_variant(
        &self,
        album: &AlbumRecord,
        size: SizeVariant,
        priority: Priority,
    ) -> Result<AssetRecord> {
        let key = Self::require_key(album)?;
        if !size.is_derived() {
            return self.ensure_original(album, &key, priority).await;
        }

        let _guard = self.locks.lock(album.id, size).await?;
        if let Some(hit) = self.current_asset(album.id, size, &key)? {
            return Ok(hit);
        }
        let original = self.ensure_original(album, &key, priority).await?;
        self.derive(album.id, &key, &original, &[size])
            .await?
            .pop()
            .ok_or_else(|| ArtworkError::Other("derive produced no variant".into()))
    }

    /// Ensure the original and every derived variant, decoding the original
    /// at most once. Returns the records in `SizeVariant::ALL` order.
    pub async fn ensure_all(&self, album: &AlbumRecord, priority: Priority) -> Result<Vec<AssetRecord>> {
        let key = Self::require_key(album)?;

        // Derived locks in fixed order, then the original, same as `ensure`
        let mut guards = Vec::with_capacity(SizeVariant::DERIVED.len());
        for size in SizeVariant::DERIVED {
            guards.push(self.locks.lock(album.id, size).await?);
        }

        let result = async {
            let original = self.ensure_original(album, &key, priority).await?;

            let mut records = vec![original.clone()];
            let mut missing = Vec::new();
            for size in SizeVariant::DERIVED {
                match self.current_asset(album.id, size, &key)? {
                    Some(hit) => records.push(hit),
                    None => missing.push(size),
                }
            }
            if !missing.is_empty() {
                records.extend(self.derive(album.id, &key, &original, &missing).await?);
            }
            records.sort_by_key(|r| r.size_variant);
            Ok::<_, ArtworkError>(records)
        }
        .await;

        drop(guards);
        if let Err(e) = &result {
            self.note_failure(album.id, SizeVariant::Original, e);
        }
        result
    }

    fn require_key(album: &AlbumRecord) -> Result<String> {
        CacheLayout::key_for(album).ok_or_else(|| ArtworkError::NoArtwork {
            album_id: album.id,
            reason: "album has no artwork reference".into(),
        })
    }

    fn note_failure(&self, album_id: i64, size: SizeVariant, err: &ArtworkError) {
        Counters::bump(&self.counters.failures);
        match err {
            ArtworkError::NoArtwork { .. } => {
                debug!("No artwork for album {} ({}): {}", album_id, size, err)
            }
            ArtworkError::MalformedAsset { .. } => {
                error!("Malformed artwork for album {} ({}): {}", album_id, size, err)
            }
            _ => warn!("Failed to ensure artwork for album {} ({}): {}", album_id, size, err),
        }
    }

    /// Indexed row for (album, size) if it matches `key` and its file exists.
    fn current_asset(&self, album_id: i64, size: SizeVariant, key: &str) -> Result<Option<AssetRecord>> {
        let Some(mut record) = self.index.get(album_id, size)? else {
            return Ok(None);
        };
        if record.cache_key != key || !self.asset_path(&record).is_file() {
            debug!("Cache miss for album {} ({})", album_id, size);
            return Ok(None);
        }
        let now = Utc::now();
        self.index.touch(album_id, size, now)?;
        record.last_accessed_at = now;
        Counters::bump(&self.counters.cache_hits);
        debug!("Cache hit for album {} ({})", album_id, size);
        Ok(Some(record))
    }

    async fn ensure_original(
        &self,
        album: &AlbumRecord,
        key: &str,
        priority: Priority,
    ) -> Result<AssetRecord> {
        let _guard = self.locks.lock(album.id, SizeVariant::Original).await?;

        if let Some(hit) = self.current_asset(album.id, SizeVariant::Original, key)? {
            return Ok(hit);
        }

        let now = Utc::now();
        if let Some(negative) = self.index.get_negative(key, now)? {
            Counters::bump(&self.counters.negative_hits);
            debug!(
                "Negative cache hit for album {} until {}",
                album.id, negative.expires_at
            );
            return Err(Self::negative_error(album, &negative));
        }

        let source_url = album.source_reference().unwrap_or_default();
        match self.fetch_original(album, key, &source_url, priority).await {
            Ok(record) => Ok(record),
            Err(e) => {
                self.remember_absence(album.id, key, &e)?;
                Err(e)
            }
        }
    }

    async fn fetch_original(
        &self,
        album: &AlbumRecord,
        key: &str,
        source_url: &str,
        priority: Priority,
    ) -> Result<AssetRecord> {
        let (fetched, stats) = retry_async(&self.retry, move |_| async move {
            self.limiter.acquire(priority).await;
            Counters::bump(&self.counters.upstream_requests);
            self.source.fetch(album.id, source_url).await
        })
        .await;
        let fetched = fetched?;

        let url = source_url.to_string();
        let bytes = fetched.bytes;
        let layout = self.layout.clone();
        let key_owned = key.to_string();
        let (info, byte_size) = run_blocking(move || {
            let info = derive::inspect(&url, &bytes)?;
            // Decode fully once so truncated payloads are rejected before storing
            derive::decode(&url, &bytes)?;
            let path = layout.path(SizeVariant::Original, &key_owned, info.extension());
            atomic_write_bytes(&path, &bytes)?;
            Ok((info, bytes.len() as u64))
        })
        .await?;

        let now = Utc::now();
        let record = AssetRecord {
            album_id: album.id,
            size_variant: SizeVariant::Original,
            cache_key: key.to_string(),
            file_extension: info.extension().to_string(),
            byte_size,
            created_at: now,
            last_accessed_at: now,
        };
        self.index.upsert(&record)?;
        self.index.clear_negative(key)?;
        Counters::bump(&self.counters.originals_fetched);
        info!(
            "Cached original artwork for album {} ({}x{} {}, {} bytes, {} attempt(s), {:?} backoff)",
            album.id,
            info.width,
            info.height,
            record.file_extension,
            byte_size,
            stats.attempts,
            stats.total_delay
        );
        Ok(record)
    }

    /// Render `sizes` from the cached original. Caller holds their locks.
    async fn derive(
        &self,
        album_id: i64,
        key: &str,
        original: &AssetRecord,
        sizes: &[SizeVariant],
    ) -> Result<Vec<AssetRecord>> {
        let original_path = self.asset_path(original);
        let layout = self.layout.clone();
        let policy = self.crop_policy;
        let key_owned = key.to_string();
        let sizes_owned = sizes.to_vec();

        let rendered = run_blocking(move || {
            let label = original_path.display().to_string();
            let bytes = std::fs::read(&original_path)
                .map_err(|e| ArtworkError::io_with_path(e, &original_path))?;
            let image = derive::decode(&label, &bytes)?;

            let mut written = Vec::with_capacity(sizes_owned.len());
            for size in sizes_owned {
                let jpeg = derive::render_variant(&label, &image, size, policy)?;
                let path = layout.path(size, &key_owned, DERIVED_EXTENSION);
                atomic_write_bytes(&path, &jpeg)?;
                written.push((size, jpeg.len() as u64));
            }
            Ok(written)
        })
        .await?;

        let now = Utc::now();
        self.index.touch(album_id, SizeVariant::Original, now)?;

        let mut records = Vec::with_capacity(rendered.len());
        for (size, byte_size) in rendered {
            let record = AssetRecord {
                album_id,
                size_variant: size,
                cache_key: key.to_string(),
                file_extension: DERIVED_EXTENSION.to_string(),
                byte_size,
                created_at: now,
                last_accessed_at: now,
            };
            self.index.upsert(&record)?;
            Counters::bump(&self.counters.variants_derived);
            debug!("Derived {} variant for album {} ({} bytes)", size, album_id, byte_size);
            records.push(record);
        }
        Ok(records)
    }

    fn remember_absence(&self, album_id: i64, key: &str, err: &ArtworkError) -> Result<()> {
        if !err.is_cacheable_absence() {
            return Ok(());
        }
        let (kind, ttl) = match err {
            ArtworkError::MalformedAsset { .. } => (NegativeKind::Malformed, self.malformed_ttl),
            _ => (NegativeKind::NoArtwork, self.negative_ttl),
        };
        let now = Utc::now();
        let entry = NegativeEntry {
            cache_key: key.to_string(),
            album_id,
            kind,
            reason: err.to_string(),
            recorded_at: now,
            expires_at: expiry(now, ttl),
        };
        self.index.record_negative(&entry)?;
        debug!(
            "Recorded negative lookup for album {} ({}) until {}",
            album_id,
            kind.as_str(),
            entry.expires_at
        );
        Ok(())
    }

    fn negative_error(album: &AlbumRecord, entry: &NegativeEntry) -> ArtworkError {
        match entry.kind {
            NegativeKind::NoArtwork => ArtworkError::NoArtwork {
                album_id: album.id,
                reason: format!("negatively cached: {}", entry.reason),
            },
            NegativeKind::Malformed => ArtworkError::MalformedAsset {
                url: album.source_reference().unwrap_or_default(),
                message: format!("negatively cached: {}", entry.reason),
            },
        }
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ArtworkError::Other(format!("Blocking task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteAssetIndex;
    use crate::network::FetchedArtwork;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct Scripted {
        calls: AtomicUsize,
        respond: Box<dyn Fn(i64, usize) -> Result<FetchedArtwork> + Send + Sync>,
    }

    #[async_trait]
    impl ArtworkSource for Scripted {
        async fn fetch(&self, album_id: i64, _url: &str) -> Result<FetchedArtwork> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.respond)(album_id, n)
        }
    }

    fn png() -> Result<FetchedArtwork> {
        Ok(FetchedArtwork {
            bytes: derive::test_png(240, 240),
            content_type: Some("image/png".into()),
        })
    }

    fn pipeline(dir: &TempDir, source: Arc<Scripted>) -> FetchPipeline {
        let config = ArtworkCacheConfig::with_root(dir.path());
        let layout = CacheLayout::new(dir.path(), "/art");
        layout.ensure_directories().unwrap();
        FetchPipeline::new(
            &config,
            layout,
            Arc::new(SqliteAssetIndex::in_memory().unwrap()),
            source,
            Arc::new(FetchLimiter::new(1000.0).unwrap()),
        )
        .with_retry(
            RetryConfig::default()
                .with_base_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    fn album(id: i64) -> AlbumRecord {
        AlbumRecord::new(id).with_cover_url(format!("https://img.example.org/{}.png", id))
    }

    #[tokio::test]
    async fn test_ensure_fetches_once_then_hits() {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            respond: Box::new(|_, _| png()),
        });
        let pipeline = pipeline(&temp_dir, source.clone());

        let medium = pipeline
            .ensure(&album(1), SizeVariant::Medium, Priority::Live)
            .await
            .unwrap();
        assert!(pipeline.asset_path(&medium).is_file());
        assert_eq!(medium.file_extension, "jpg");

        let original = pipeline.index().get(1, SizeVariant::Original).unwrap().unwrap();
        assert_eq!(original.file_extension, "png");
        assert_eq!(
            std::fs::read(pipeline.asset_path(&original)).unwrap(),
            derive::test_png(240, 240)
        );

        // Second size reuses the cached original
        pipeline
            .ensure(&album(1), SizeVariant::Large, Priority::Live)
            .await
            .unwrap();
        let again = pipeline
            .ensure(&album(1), SizeVariant::Medium, Priority::Live)
            .await
            .unwrap();
        assert_eq!(again.cache_key, medium.cache_key);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(pipeline.stats().cache_hits >= 2);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            respond: Box::new(|_, n| {
                if n == 0 {
                    Err(ArtworkError::SourceUnavailable {
                        url: "u".into(),
                        message: "503".into(),
                        status: Some(503),
                    })
                } else {
                    png()
                }
            }),
        });
        let pipeline = pipeline(&temp_dir, source.clone());

        pipeline
            .ensure(&album(2), SizeVariant::Original, Priority::Background)
            .await
            .unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.stats().upstream_requests, 2);
    }

    #[tokio::test]
    async fn test_malformed_bytes_are_negatively_cached() {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            respond: Box::new(|_, _| {
                Ok(FetchedArtwork {
                    bytes: b"<html>oops</html>".to_vec(),
                    content_type: Some("text/html".into()),
                })
            }),
        });
        let pipeline = pipeline(&temp_dir, source.clone());

        for _ in 0..2 {
            let err = pipeline
                .ensure(&album(3), SizeVariant::Small, Priority::Live)
                .await
                .unwrap_err();
            assert!(matches!(err, ArtworkError::MalformedAsset { .. }));
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(pipeline.index().get(3, SizeVariant::Original).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_changed_reference_produces_new_key() {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            respond: Box::new(|_, _| png()),
        });
        let pipeline = pipeline(&temp_dir, source.clone());

        let old = pipeline
            .ensure(&album(4), SizeVariant::Thumbnail, Priority::Live)
            .await
            .unwrap();
        let corrected = AlbumRecord::new(4).with_cover_url("https://img.example.org/fixed.png");
        let new = pipeline
            .ensure(&corrected, SizeVariant::Thumbnail, Priority::Live)
            .await
            .unwrap();

        assert_ne!(old.cache_key, new.cache_key);
        // Stale file stays in place for the orphan sweep
        assert!(pipeline.asset_path(&old).is_file());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ensure_all_and_concurrent_callers() {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            respond: Box::new(|_, _| png()),
        });
        let pipeline = Arc::new(pipeline(&temp_dir, source.clone()));

        let mut handles = Vec::new();
        for size in SizeVariant::ALL {
            let pipeline = pipeline.clone();
            handles.push(tokio::spawn(async move {
                pipeline.ensure(&album(5), size, Priority::Live).await
            }));
        }
        let all = pipeline.ensure_all(&album(5), Priority::Background).await.unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(all.len(), 5);
        assert_eq!(all[0].size_variant, SizeVariant::Original);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.index().list_album(5).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_album_without_reference_is_no_artwork() {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            respond: Box::new(|_, _| png()),
        });
        let pipeline = pipeline(&temp_dir, source.clone());

        let err = pipeline
            .ensure(&AlbumRecord::new(6), SizeVariant::Large, Priority::Live)
            .await
            .unwrap_err();
        assert!(matches!(err, ArtworkError::NoArtwork { album_id: 6, .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }
}
