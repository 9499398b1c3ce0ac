//! Integration tests for the HTTP routes.

use artwork_core::{
    AlbumRecord, ArtworkCache, ArtworkCacheConfig, ArtworkError, ArtworkSource, FetchedArtwork,
    StaticCatalog,
};
use artwork_server::build_router;
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tower::ServiceExt;

struct FakeSource;

#[async_trait]
impl ArtworkSource for FakeSource {
    async fn fetch(&self, album_id: i64, url: &str) -> artwork_core::Result<FetchedArtwork> {
        if album_id == 9 {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if album_id == 7 {
            return Err(ArtworkError::NoArtwork {
                album_id,
                reason: format!("404 from {}", url),
            });
        }
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::new_rgb8(120, 120)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        Ok(FetchedArtwork {
            bytes: buf.into_inner(),
            content_type: Some("image/png".into()),
        })
    }
}

async fn app(temp_dir: &TempDir) -> Router {
    let mut config = ArtworkCacheConfig::with_root(temp_dir.path().join("artwork_cache"));
    config.requests_per_second = 1000.0;
    let catalog = StaticCatalog::new([
        AlbumRecord::new(1).with_cover_url("https://img.example.org/1.png"),
        AlbumRecord::new(7).with_cover_url("https://img.example.org/7.png"),
        AlbumRecord::new(9).with_cover_url("https://img.example.org/9.png"),
    ]);
    let cache = ArtworkCache::builder(config)
        .catalog(Arc::new(catalog))
        .source(Arc::new(FakeSource))
        .build()
        .await
        .unwrap();
    build_router(Arc::new(cache))
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health() {
    let temp_dir = TempDir::new().unwrap();
    let app = app(&temp_dir).await;
    let (status, body) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_artwork_url_resolves_and_serves_file() {
    let temp_dir = TempDir::new().unwrap();
    let app = app(&temp_dir).await;

    let (status, body) = get_json(&app, "/artwork-url?album_id=1&size=medium&mode=wait").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "cache");
    let url = body["url"].as_str().unwrap().to_string();
    assert!(url.starts_with("/static/artwork_cache/medium/"));

    let (status, bytes) = get(&app, &url).await;
    assert_eq!(status, StatusCode::OK);
    let image = image::load_from_memory(&bytes).unwrap();
    assert_eq!((image.width(), image.height()), (64, 64));
}

#[tokio::test]
async fn test_artwork_url_fallbacks() {
    let temp_dir = TempDir::new().unwrap();
    let app = app(&temp_dir).await;

    let (status, body) = get_json(&app, "/artwork-url?album_id=7&size=large").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "external");
    assert_eq!(body["url"], "https://img.example.org/7.png");

    let (_, body) = get_json(&app, "/artwork-url?album_id=404").await;
    assert_eq!(body["source"], "placeholder");

    // Cold cache without mode=wait: the recorded URL now, the fetch later
    let (_, body) = get_json(&app, "/artwork-url?album_id=1&size=small").await;
    assert_eq!(body["source"], "external");
}

#[tokio::test]
async fn test_slow_source_does_not_delay_default_answer() {
    let temp_dir = TempDir::new().unwrap();
    let app = app(&temp_dir).await;

    let started = Instant::now();
    let (status, body) = get_json(&app, "/artwork-url?album_id=9&size=medium").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "external");
    assert_eq!(body["url"], "https://img.example.org/9.png");
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_artwork_url_rejects_bad_params() {
    let temp_dir = TempDir::new().unwrap();
    let app = app(&temp_dir).await;

    let (status, _) = get_json(&app, "/artwork-url?size=medium").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, body) = get_json(&app, "/artwork-url?album_id=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("album_id"));
}

#[tokio::test]
async fn test_stats() {
    let temp_dir = TempDir::new().unwrap();
    let app = app(&temp_dir).await;
    get_json(&app, "/artwork-url?album_id=1&size=thumbnail&mode=wait").await;

    let (status, body) = get_json(&app, "/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["index"]["asset_count"], 2);
    assert_eq!(body["disk"]["total_files"], 2);
    assert_eq!(body["resolver"]["cache_hits"], 1);
}
