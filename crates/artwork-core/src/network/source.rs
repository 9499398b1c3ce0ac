//! Upstream artwork source.

use crate::config::{ArtworkCacheConfig, NetworkConfig};
use crate::error::{ArtworkError, Result};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Raw bytes as served by the upstream source.
#[derive(Debug, Clone)]
pub struct FetchedArtwork {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Where original artwork comes from.
///
/// Implementations classify failures into the fetch taxonomy:
/// confirmed absence is `NoArtwork`, transient trouble is
/// `SourceUnavailable`, and unusable payloads are `MalformedAsset`.
#[async_trait]
pub trait ArtworkSource: Send + Sync {
    /// Perform one upstream request. Rate limiting and retries are the
    /// caller's job.
    async fn fetch(&self, album_id: i64, url: &str) -> Result<FetchedArtwork>;
}

/// HTTP source backed by reqwest.
pub struct HttpArtworkSource {
    client: Client,
    max_bytes: u64,
}

impl HttpArtworkSource {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| ArtworkError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, max_bytes })
    }

    pub fn from_config(config: &ArtworkCacheConfig) -> Result<Self> {
        Self::new(config.request_timeout, config.max_artwork_bytes)
    }

    fn classify_status(album_id: i64, url: &str, status: StatusCode) -> ArtworkError {
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => ArtworkError::NoArtwork {
                album_id,
                reason: format!("upstream returned {}", status.as_u16()),
            },
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
                ArtworkError::SourceUnavailable {
                    url: url.to_string(),
                    message: format!("upstream returned {}", status),
                    status: Some(status.as_u16()),
                }
            }
            s if s.is_server_error() => ArtworkError::SourceUnavailable {
                url: url.to_string(),
                message: format!("upstream returned {}", s),
                status: Some(s.as_u16()),
            },
            // Remaining client errors will not change on retry
            s => ArtworkError::NoArtwork {
                album_id,
                reason: format!("upstream returned {}", s.as_u16()),
            },
        }
    }

    fn classify_transport(album_id: i64, url: &str, err: reqwest::Error) -> ArtworkError {
        if err.is_builder() {
            return ArtworkError::NoArtwork {
                album_id,
                reason: format!("invalid artwork URL: {}", err),
            };
        }
        ArtworkError::SourceUnavailable {
            url: url.to_string(),
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }

    fn too_large(&self, url: &str, size: u64) -> ArtworkError {
        ArtworkError::MalformedAsset {
            url: url.to_string(),
            message: format!("{} bytes exceeds limit of {} bytes", size, self.max_bytes),
        }
    }
}

#[async_trait]
impl ArtworkSource for HttpArtworkSource {
    async fn fetch(&self, album_id: i64, url: &str) -> Result<FetchedArtwork> {
        debug!("Fetching artwork for album {} from {}", album_id, url);

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Self::classify_transport(album_id, url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify_status(album_id, url, status));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(self.too_large(url, length));
            }
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Self::classify_transport(album_id, url, e))?
        {
            bytes.extend_from_slice(&chunk);
            if bytes.len() as u64 > self.max_bytes {
                return Err(self.too_large(url, bytes.len() as u64));
            }
        }

        if bytes.is_empty() {
            return Err(ArtworkError::MalformedAsset {
                url: url.to_string(),
                message: "empty response body".into(),
            });
        }

        Ok(FetchedArtwork {
            bytes,
            content_type,
        })
    }
}
