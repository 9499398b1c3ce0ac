//! HTTP request handlers.

use crate::server::AppState;
use artwork_core::SizeVariant;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};

/// Query string of `GET /artwork-url`.
#[derive(Debug, Deserialize)]
pub struct ArtworkUrlQuery {
    pub album_id: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    /// URL to use instead of the placeholder when nothing better is known.
    #[serde(default)]
    pub fallback: Option<String>,
    /// `wait` fetches a cold variant before answering, bounded by the
    /// resolve timeout. Anything else answers immediately.
    #[serde(default)]
    pub mode: Option<String>,
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
        .into_response()
}

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Resolve the best URL for (album, size). Always answers with a URL for a
/// well-formed request; callers treat anything else as a miss.
///
/// By default a cold cache answers with the fallback chain at once and the
/// fetch runs in the background.
pub async fn handle_artwork_url(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ArtworkUrlQuery>,
) -> Response {
    let Some(raw_id) = query.album_id.as_deref() else {
        return bad_request("album_id is required");
    };
    let album_id = match raw_id.trim().parse::<i64>() {
        Ok(id) => id,
        Err(_) => return bad_request(format!("invalid album_id: {}", raw_id)),
    };
    let size = query
        .size
        .as_deref()
        .map(SizeVariant::normalize)
        .unwrap_or(SizeVariant::Medium);
    let fallback = query.fallback.as_deref().filter(|f| !f.is_empty());

    let resolved = if query.mode.as_deref() == Some("wait") {
        state.cache.resolve_url(album_id, size, fallback).await
    } else {
        state.cache.resolve_url_sync(album_id, size, fallback)
    };
    debug!(
        "Resolved album {} ({}) to {:?} URL",
        album_id, size, resolved.source
    );
    Json(resolved).into_response()
}

/// Combined cache statistics.
pub async fn handle_stats(State(state): State<Arc<AppState>>) -> Response {
    let cache = state.cache.clone();
    match tokio::task::spawn_blocking(move || cache.stats()).await {
        Ok(Ok(stats)) => Json(stats).into_response(),
        Ok(Err(e)) => {
            error!("Failed to collect cache stats: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string(), "kind": e.kind() })),
            )
                .into_response()
        }
        Err(e) => {
            error!("Stats task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
