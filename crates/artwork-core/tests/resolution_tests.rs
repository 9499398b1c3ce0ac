//! Integration tests for URL resolution and the session mirror.

mod common;

use std::sync::Arc;
use std::time::Duration;

use artwork_core::{AlbumRecord, ArtworkCache, ArtworkUrlMirror, ResolvedUrl, SizeVariant, UrlOrigin};
use common::{build, catalog, config, FakeSource};
use tempfile::TempDir;

/// Poll the synchronous resolver until the background refresh lands.
async fn wait_for_cache(cache: &ArtworkCache, album_id: i64, size: SizeVariant) -> ResolvedUrl {
    for _ in 0..200 {
        let resolved = cache.resolve_url_sync(album_id, size, None);
        if resolved.source == UrlOrigin::Cache {
            return resolved;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("album {} never reached the cache", album_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cold_sync_resolve_returns_recorded_url_then_cached() {
    let temp_dir = TempDir::new().unwrap();
    let source = FakeSource::new();
    let cache = build(config(&temp_dir), catalog([42]), source.clone()).await;

    let first = cache.resolve_url_sync(42, SizeVariant::Medium, None);
    assert_eq!(first.source, UrlOrigin::External);
    assert_eq!(first.url, "https://img.example.org/covers/42.png");

    let cached = wait_for_cache(&cache, 42, SizeVariant::Medium).await;
    assert!(cached.url.starts_with("/static/artwork_cache/medium/"));
    assert!(cached.url.ends_with(".jpg"));
    assert_eq!(source.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cold_sync_resolve_without_recorded_url_uses_placeholder() {
    let temp_dir = TempDir::new().unwrap();
    let source = FakeSource::new();
    let catalog = catalog(std::iter::empty());
    catalog.upsert(AlbumRecord::new(43).with_musicbrainz_id("b1a9c0e9-d987-4042-ae91-78d6a3267d69"));
    let cache = build(config(&temp_dir), catalog, source.clone()).await;

    let first = cache.resolve_url_sync(43, SizeVariant::Small, None);
    assert_eq!(first.source, UrlOrigin::Placeholder);
    assert_eq!(first.url, "/static/img/album-placeholder.svg");

    wait_for_cache(&cache, 43, SizeVariant::Small).await;
}

#[tokio::test]
async fn test_recorded_url_outranks_caller_fallback() {
    let temp_dir = TempDir::new().unwrap();
    let catalog = catalog([1]);
    catalog.upsert(AlbumRecord::new(2));
    let cache = build(config(&temp_dir), catalog, FakeSource::new()).await;

    let recorded = cache.resolve_url_sync(1, SizeVariant::Large, Some("/static/img/custom.svg"));
    assert_eq!(recorded.url, "https://img.example.org/covers/1.png");
    assert_eq!(recorded.source, UrlOrigin::External);

    // Without a recorded URL the caller's fallback replaces the placeholder
    let replaced = cache.resolve_url_sync(2, SizeVariant::Large, Some("/static/img/custom.svg"));
    assert_eq!(replaced.url, "/static/img/custom.svg");
    assert_eq!(replaced.source, UrlOrigin::Placeholder);

    let unknown = cache.resolve_url(999, SizeVariant::Large, Some("/static/img/custom.svg")).await;
    assert_eq!(unknown.url, "/static/img/custom.svg");
    let unknown = cache.resolve_url(999, SizeVariant::Large, None).await;
    assert_eq!(unknown.source, UrlOrigin::Placeholder);
    assert_eq!(unknown.url, "/static/img/album-placeholder.svg");
}

#[tokio::test]
async fn test_resolution_is_idempotent_until_reference_changes() {
    let temp_dir = TempDir::new().unwrap();
    let source = FakeSource::new();
    let catalog = catalog([5]);
    let cache = build(config(&temp_dir), catalog.clone(), source.clone()).await;

    let first = cache.resolve_url(5, SizeVariant::Large, None).await;
    assert_eq!(first.source, UrlOrigin::Cache);
    for _ in 0..3 {
        assert_eq!(cache.resolve_url(5, SizeVariant::Large, None).await, first);
        assert_eq!(cache.resolve_url_sync(5, SizeVariant::Large, None), first);
    }
    assert_eq!(source.calls(), 1);

    catalog.upsert(AlbumRecord::new(5).with_cover_url("https://img.example.org/covers/5-v2.png"));
    let second = cache.resolve_url(5, SizeVariant::Large, None).await;
    assert_eq!(second.source, UrlOrigin::Cache);
    assert_ne!(second.url, first.url);
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_missing_artwork_degrades_to_fallback() {
    let temp_dir = TempDir::new().unwrap();
    let source = FakeSource::new();
    source.missing(8);
    let cache = build(config(&temp_dir), catalog([8]), source.clone()).await;

    let resolved = cache.resolve_url(8, SizeVariant::Thumbnail, None).await;
    assert_eq!(resolved.source, UrlOrigin::External);
    let again = cache.resolve_url(8, SizeVariant::Thumbnail, None).await;
    assert_eq!(again, resolved);
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn test_mirror_over_resolver() {
    let temp_dir = TempDir::new().unwrap();
    let source = FakeSource::new();
    let cache = build(config(&temp_dir), catalog([3]), source.clone()).await;
    let mirror = ArtworkUrlMirror::from_config(Arc::clone(cache.resolver()), cache.config());

    let first = mirror.get(3, SizeVariant::Medium).await.unwrap();
    assert_eq!(first.source, UrlOrigin::Cache);
    let second = mirror.get(3, SizeVariant::Medium).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(mirror.hit_counts(), (1, 1));
    assert_eq!(source.calls(), 1);
}
