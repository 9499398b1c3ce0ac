//! Short-lived, session-local mirror of resolved artwork URLs.
//!
//! Sits in front of a [`UrlSource`] to collapse repeated resolutions during
//! one rendering session. Its TTL is minutes; it is unrelated to disk
//! retention. Only cache-backed URLs are kept, so a fallback is never pinned
//! while the real artwork is still being fetched.

use crate::config::{ArtworkCacheConfig, SizeVariant};
use crate::error::{ArtworkError, Result};
use crate::resolver::{ArtworkResolver, ResolvedUrl, UrlOrigin};
use async_trait::async_trait;
use mini_moka::sync::Cache;
use reqwest::Client;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Anything that can resolve an artwork URL. `None` means "miss".
#[async_trait]
pub trait UrlSource: Send + Sync {
    async fn resolve(&self, album_id: i64, size: SizeVariant) -> Option<ResolvedUrl>;
}

#[async_trait]
impl<T: UrlSource + ?Sized> UrlSource for Arc<T> {
    async fn resolve(&self, album_id: i64, size: SizeVariant) -> Option<ResolvedUrl> {
        (**self).resolve(album_id, size).await
    }
}

#[async_trait]
impl UrlSource for ArtworkResolver {
    async fn resolve(&self, album_id: i64, size: SizeVariant) -> Option<ResolvedUrl> {
        Some(self.resolve_url(album_id, size, None).await)
    }
}

/// Calls a remote `/artwork-url` endpoint.
pub struct RemoteUrlSource {
    client: Client,
    endpoint: Url,
}

#[derive(Deserialize)]
struct ArtworkUrlResponse {
    url: String,
    #[serde(default)]
    source: Option<UrlOrigin>,
}

impl RemoteUrlSource {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:8080/`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(base_url)
            .and_then(|base| base.join("artwork-url"))
            .map_err(|e| ArtworkError::Config {
                message: format!("invalid resolution endpoint {}: {}", base_url, e),
            })?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArtworkError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl UrlSource for RemoteUrlSource {
    async fn resolve(&self, album_id: i64, size: SizeVariant) -> Option<ResolvedUrl> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("album_id", &album_id.to_string())
            .append_pair("size", size.as_str());

        let response = match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!("Artwork URL lookup returned {}", response.status());
                return None;
            }
            Err(e) => {
                debug!("Artwork URL lookup failed: {}", e);
                return None;
            }
        };

        let body: ArtworkUrlResponse = response.json().await.ok()?;
        Some(ResolvedUrl {
            url: body.url,
            source: body.source.unwrap_or(UrlOrigin::External),
        })
    }
}

pub struct ArtworkUrlMirror<S> {
    source: S,
    entries: Cache<(i64, SizeVariant), ResolvedUrl>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<S: UrlSource> ArtworkUrlMirror<S> {
    pub fn new(source: S, ttl: Duration, capacity: u64) -> Self {
        Self {
            source,
            entries: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(capacity)
                .build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn from_config(source: S, config: &ArtworkCacheConfig) -> Self {
        Self::new(source, config.mirror_ttl, config.mirror_capacity)
    }

    /// Read through the mirror. `None` means the source missed; the caller
    /// renders its own fallback.
    pub async fn get(&self, album_id: i64, size: SizeVariant) -> Option<ResolvedUrl> {
        let key = (album_id, size);
        if let Some(hit) = self.entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let resolved = self.source.resolve(album_id, size).await?;
        if resolved.source == UrlOrigin::Cache {
            self.entries.insert(key, resolved.clone());
        }
        Some(resolved)
    }

    /// Forget every size of one album.
    pub fn invalidate(&self, album_id: i64) {
        for size in SizeVariant::ALL {
            self.entries.invalidate(&(album_id, size));
        }
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    /// (hits, misses) since creation.
    pub fn hit_counts(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
