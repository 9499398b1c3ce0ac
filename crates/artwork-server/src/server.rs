//! HTTP server implementation using Axum.

use crate::handler::{handle_artwork_url, handle_health, handle_stats};
use artwork_core::ArtworkCache;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Application state shared across handlers.
pub struct AppState {
    pub cache: Arc<ArtworkCache>,
}

/// Routes plus static serving of the cache root under its URL prefix.
pub fn build_router(cache: Arc<ArtworkCache>) -> Router {
    let url_prefix = cache.config().url_prefix.trim_end_matches('/').to_string();
    let files = ServeDir::new(cache.layout().root());
    let state = Arc::new(AppState { cache });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/artwork-url", get(handle_artwork_url))
        .route("/stats", get(handle_stats))
        .nest_service(&url_prefix, files)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve in the background.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(
    cache: Arc<ArtworkCache>,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let app = build_router(cache);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    Ok(actual_addr)
}
