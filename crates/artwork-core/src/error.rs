//! Error types for the artwork cache.
//!
//! The fetch-related variants mirror how the upstream artwork source can fail,
//! so callers can decide between retrying, negative caching and giving up.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the artwork cache.
#[derive(Debug, Error)]
pub enum ArtworkError {
    // Upstream outcomes
    #[error("No artwork available for album {album_id}: {reason}")]
    NoArtwork { album_id: i64, reason: String },

    #[error("Artwork source unavailable for {url}: {message}")]
    SourceUnavailable {
        url: String,
        message: String,
        /// HTTP status when the upstream answered at all
        status: Option<u16>,
    },

    #[error("Malformed artwork from {url}: {message}")]
    MalformedAsset { url: String, message: String },

    // File system errors
    #[error("Storage error at {path:?}: {message}")]
    Storage {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Album not found: {album_id}")]
    AlbumNotFound { album_id: i64 },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for artwork cache operations.
pub type Result<T> = std::result::Result<T, ArtworkError>;

impl From<std::io::Error> for ArtworkError {
    fn from(err: std::io::Error) -> Self {
        ArtworkError::Storage {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ArtworkError {
    fn from(err: serde_json::Error) -> Self {
        ArtworkError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for ArtworkError {
    fn from(err: rusqlite::Error) -> Self {
        ArtworkError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ArtworkError {
    /// Create a storage error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ArtworkError::Storage {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Only transient upstream failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ArtworkError::SourceUnavailable { .. })
    }

    /// Whether this outcome should be remembered in the negative cache.
    pub fn is_cacheable_absence(&self) -> bool {
        matches!(
            self,
            ArtworkError::NoArtwork { .. } | ArtworkError::MalformedAsset { .. }
        )
    }

    /// Short machine-readable kind, used in checkpoints and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ArtworkError::NoArtwork { .. } => "no_artwork",
            ArtworkError::SourceUnavailable { .. } => "source_unavailable",
            ArtworkError::MalformedAsset { .. } => "malformed_asset",
            ArtworkError::Storage { .. } => "storage",
            ArtworkError::Database { .. } => "database",
            ArtworkError::Json { .. } => "json",
            ArtworkError::AlbumNotFound { .. } => "album_not_found",
            ArtworkError::Config { .. } => "config",
            ArtworkError::Validation { .. } => "validation",
            ArtworkError::Other(_) => "other",
        }
    }
}
