//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use artwork_core::{
    AlbumRecord, ArtworkCache, ArtworkCacheConfig, ArtworkError, ArtworkSource, CancellationToken,
    FetchedArtwork, Result, StaticCatalog,
};
use artwork_core::network::RetryConfig;
use async_trait::async_trait;
use tempfile::TempDir;

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image::DynamicImage::new_rgb8(width, height)
        .write_to(&mut buf, image::ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

/// In-process upstream that counts requests and can be told to misbehave.
#[derive(Default)]
pub struct FakeSource {
    calls: AtomicUsize,
    fetched: Mutex<Vec<(i64, Instant)>>,
    missing: Mutex<HashSet<i64>>,
    corrupt: Mutex<HashSet<i64>>,
    /// Cancel this token and hang on the given (1-based) call.
    hang_at: Mutex<Option<(usize, CancellationToken)>>,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn missing(&self, album_id: i64) {
        self.missing.lock().unwrap().insert(album_id);
    }

    pub fn corrupt(&self, album_id: i64) {
        self.corrupt.lock().unwrap().insert(album_id);
    }

    pub fn hang_at(&self, call: usize, token: CancellationToken) {
        *self.hang_at.lock().unwrap() = Some((call, token));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fetched_albums(&self) -> Vec<i64> {
        self.fetched.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    pub fn fetch_times(&self) -> Vec<Instant> {
        self.fetched.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub fn clear_history(&self) {
        self.fetched.lock().unwrap().clear();
    }
}

#[async_trait]
impl ArtworkSource for FakeSource {
    async fn fetch(&self, album_id: i64, url: &str) -> Result<FetchedArtwork> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let hang = self
            .hang_at
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(at, _)| *at == call)
            .map(|(_, token)| token.clone());
        if let Some(token) = hang {
            token.cancel();
            std::future::pending::<()>().await;
        }

        self.fetched.lock().unwrap().push((album_id, Instant::now()));

        if self.missing.lock().unwrap().contains(&album_id) {
            return Err(ArtworkError::NoArtwork {
                album_id,
                reason: format!("upstream returned 404 for {}", url),
            });
        }
        if self.corrupt.lock().unwrap().contains(&album_id) {
            return Ok(FetchedArtwork {
                bytes: b"<html>not an image</html>".to_vec(),
                content_type: Some("text/html".into()),
            });
        }
        Ok(FetchedArtwork {
            bytes: png_bytes(240, 180),
            content_type: Some("image/png".into()),
        })
    }
}

pub fn catalog(albums: impl IntoIterator<Item = i64>) -> Arc<StaticCatalog> {
    Arc::new(StaticCatalog::new(albums.into_iter().map(|id| {
        AlbumRecord::new(id).with_cover_url(format!("https://img.example.org/covers/{}.png", id))
    })))
}

pub fn config(dir: &TempDir) -> ArtworkCacheConfig {
    let mut config = ArtworkCacheConfig::with_root(dir.path().join("artwork_cache"));
    config.requests_per_second = 1000.0;
    config.resolve_timeout = Duration::from_secs(5);
    config
}

pub async fn build(
    config: ArtworkCacheConfig,
    catalog: Arc<StaticCatalog>,
    source: Arc<FakeSource>,
) -> ArtworkCache {
    ArtworkCache::builder(config)
        .catalog(catalog)
        .source(source)
        .retry(RetryConfig::default().with_base_delay(Duration::from_millis(1)).with_jitter(false))
        .build()
        .await
        .unwrap()
}
