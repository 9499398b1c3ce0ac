//! Centralized configuration for the artwork cache.
//!
//! Constant groups hold the built-in defaults; [`ArtworkCacheConfig`] is the
//! runtime configuration, loadable from a JSON file where every key is optional.

use crate::error::{ArtworkError, Result};
use crate::metadata::atomic_read_json;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Cache storage and retention defaults.
pub struct CacheDefaults;

impl CacheDefaults {
    pub const CACHE_ROOT: &'static str = "static/artwork_cache";
    pub const INDEX_DB_NAME: &'static str = "artwork_index.sqlite";
    pub const URL_PREFIX: &'static str = "/static/artwork_cache";
    pub const PLACEHOLDER_URL: &'static str = "/static/img/album-placeholder.svg";
    pub const DERIVED_TTL: Duration = Duration::from_secs(30 * 86_400);
    pub const ORIGINAL_TTL: Duration = Duration::from_secs(365 * 86_400);
    pub const NEGATIVE_TTL: Duration = Duration::from_secs(86_400);
    pub const MALFORMED_TTL: Duration = Duration::from_secs(30 * 86_400);
    pub const ORPHAN_GRACE: Duration = Duration::from_secs(3_600);
    pub const RECENT_GRACE: Duration = Duration::from_secs(7 * 86_400);
    pub const MAX_DELETIONS_PER_RUN: usize = 1000;
    /// Size-cap target as a fraction of the cap when none is configured.
    pub const TARGET_CACHE_RATIO: f64 = 0.8;
    pub const EVICTION_INTERVAL: Duration = Duration::from_secs(86_400);
    pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MIRROR_TTL: Duration = Duration::from_secs(300);
    pub const MIRROR_CAPACITY: u64 = 200;
    pub const REFRESH_QUEUE_CAPACITY: usize = 256;
}

/// Upstream artwork source configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const REQUESTS_PER_SECOND: f64 = 1.0;
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
    pub const MAX_ARTWORK_BYTES: u64 = 10 * 1024 * 1024;
    pub const MIN_DIMENSION: u32 = 10;
    pub const MAX_DIMENSION: u32 = 5000;
    pub const USER_AGENT: &'static str = "Tracklist/1.0 (artwork cache)";
    pub const COVER_ART_ARCHIVE_BASE: &'static str = "https://coverartarchive.org/release";
}

/// Migration job defaults.
pub struct MigrationDefaults;

impl MigrationDefaults {
    pub const PROGRESS_FILE: &'static str = "logs/artwork_migration_progress.json";
    pub const REPORT_FILE: &'static str = "logs/artwork_migration_report.json";
    pub const CONCURRENCY: usize = 1;
}

/// A size tier of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeVariant {
    Original,
    Large,
    Medium,
    Small,
    Thumbnail,
}

impl SizeVariant {
    pub const ALL: [SizeVariant; 5] = [
        SizeVariant::Original,
        SizeVariant::Large,
        SizeVariant::Medium,
        SizeVariant::Small,
        SizeVariant::Thumbnail,
    ];

    pub const DERIVED: [SizeVariant; 4] = [
        SizeVariant::Large,
        SizeVariant::Medium,
        SizeVariant::Small,
        SizeVariant::Thumbnail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SizeVariant::Original => "original",
            SizeVariant::Large => "large",
            SizeVariant::Medium => "medium",
            SizeVariant::Small => "small",
            SizeVariant::Thumbnail => "thumbnail",
        }
    }

    /// Target square edge in pixels; `None` for the unmodified original.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self {
            SizeVariant::Original => None,
            SizeVariant::Large => Some((192, 192)),
            SizeVariant::Medium => Some((64, 64)),
            SizeVariant::Small => Some((48, 48)),
            SizeVariant::Thumbnail => Some((80, 80)),
        }
    }

    /// JPEG quality used when encoding a derived variant; `None` for the
    /// original, which is stored as fetched.
    pub fn jpeg_quality(&self) -> Option<u8> {
        match self {
            SizeVariant::Original => None,
            SizeVariant::Large => Some(90),
            SizeVariant::Medium | SizeVariant::Small => Some(85),
            SizeVariant::Thumbnail => Some(80),
        }
    }

    pub fn is_derived(&self) -> bool {
        !matches!(self, SizeVariant::Original)
    }

    /// Lenient parse used by page rendering: unknown names become `Medium`.
    pub fn normalize(s: &str) -> Self {
        s.parse().unwrap_or(SizeVariant::Medium)
    }
}

/// Strict parse of a tier name. Accepts `thumb` as an alias.
impl FromStr for SizeVariant {
    type Err = ArtworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "original" => Ok(SizeVariant::Original),
            "large" => Ok(SizeVariant::Large),
            "medium" => Ok(SizeVariant::Medium),
            "small" => Ok(SizeVariant::Small),
            "thumbnail" | "thumb" => Ok(SizeVariant::Thumbnail),
            _ => Err(ArtworkError::Validation {
                field: "size".into(),
                message: format!("unknown size variant {:?}", s),
            }),
        }
    }
}

impl std::fmt::Display for SizeVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How an original is fitted into a square derived variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropPolicy {
    /// Scale to cover the target and crop the overflow around the center.
    #[default]
    CenterCrop,
    /// Scale to fit inside the target and pad with a white background.
    Letterbox,
}

/// Runtime configuration for the whole cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtworkCacheConfig {
    pub cache_root: PathBuf,
    /// Asset index database; defaults to `<cache_root>/artwork_index.sqlite`.
    pub index_path: Option<PathBuf>,
    pub progress_file: PathBuf,
    pub report_file: PathBuf,
    pub url_prefix: String,
    pub placeholder_url: String,
    pub crop_policy: CropPolicy,
    pub requests_per_second: f64,
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub retry_base_delay: Duration,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    pub max_artwork_bytes: u64,
    #[serde(with = "duration_secs")]
    pub derived_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub original_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub negative_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub malformed_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub orphan_grace: Duration,
    #[serde(with = "duration_secs")]
    pub eviction_interval: Duration,
    /// Assets created this recently are never removed by the size cap.
    #[serde(with = "duration_secs")]
    pub recent_grace: Duration,
    /// Total bytes of indexed assets above which a sweep frees space.
    pub max_cache_bytes: Option<u64>,
    /// Size a capped sweep shrinks to; defaults to 80% of the cap.
    pub target_cache_bytes: Option<u64>,
    /// Upper bound on indexed assets removed by one sweep.
    pub max_deletions_per_run: usize,
    #[serde(with = "duration_secs")]
    pub resolve_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub mirror_ttl: Duration,
    pub mirror_capacity: u64,
    pub migration_concurrency: usize,
}

impl Default for ArtworkCacheConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from(CacheDefaults::CACHE_ROOT),
            index_path: None,
            progress_file: PathBuf::from(MigrationDefaults::PROGRESS_FILE),
            report_file: PathBuf::from(MigrationDefaults::REPORT_FILE),
            url_prefix: CacheDefaults::URL_PREFIX.to_string(),
            placeholder_url: CacheDefaults::PLACEHOLDER_URL.to_string(),
            crop_policy: CropPolicy::default(),
            requests_per_second: NetworkConfig::REQUESTS_PER_SECOND,
            max_retries: NetworkConfig::MAX_RETRIES,
            retry_base_delay: NetworkConfig::RETRY_BASE_DELAY,
            request_timeout: NetworkConfig::REQUEST_TIMEOUT,
            max_artwork_bytes: NetworkConfig::MAX_ARTWORK_BYTES,
            derived_ttl: CacheDefaults::DERIVED_TTL,
            original_ttl: CacheDefaults::ORIGINAL_TTL,
            negative_ttl: CacheDefaults::NEGATIVE_TTL,
            malformed_ttl: CacheDefaults::MALFORMED_TTL,
            orphan_grace: CacheDefaults::ORPHAN_GRACE,
            eviction_interval: CacheDefaults::EVICTION_INTERVAL,
            recent_grace: CacheDefaults::RECENT_GRACE,
            max_cache_bytes: None,
            target_cache_bytes: None,
            max_deletions_per_run: CacheDefaults::MAX_DELETIONS_PER_RUN,
            resolve_timeout: CacheDefaults::RESOLVE_TIMEOUT,
            mirror_ttl: CacheDefaults::MIRROR_TTL,
            mirror_capacity: CacheDefaults::MIRROR_CAPACITY,
            migration_concurrency: MigrationDefaults::CONCURRENCY,
        }
    }
}

impl ArtworkCacheConfig {
    /// Config rooted at `cache_root`, with the checkpoint files kept beside it.
    pub fn with_root(cache_root: impl Into<PathBuf>) -> Self {
        let cache_root = cache_root.into();
        Self {
            progress_file: cache_root.join("artwork_migration_progress.json"),
            report_file: cache_root.join("artwork_migration_report.json"),
            cache_root,
            ..Self::default()
        }
    }

    /// Load from a JSON file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = atomic_read_json(path)?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    pub fn index_path(&self) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| self.cache_root.join(CacheDefaults::INDEX_DB_NAME))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.requests_per_second.is_finite() && self.requests_per_second > 0.0) {
            return Err(ArtworkError::Validation {
                field: "requests_per_second".into(),
                message: format!("must be positive, got {}", self.requests_per_second),
            });
        }
        if self.max_retries == 0 {
            return Err(ArtworkError::Validation {
                field: "max_retries".into(),
                message: "at least one attempt is required".into(),
            });
        }
        if self.migration_concurrency == 0 {
            return Err(ArtworkError::Validation {
                field: "migration_concurrency".into(),
                message: "must be at least 1".into(),
            });
        }
        let prefix = self.url_prefix.trim_end_matches('/');
        if !prefix.starts_with('/') || prefix.len() < 2 {
            return Err(ArtworkError::Validation {
                field: "url_prefix".into(),
                message: format!("must be an absolute, non-root path, got {:?}", self.url_prefix),
            });
        }
        if self.max_deletions_per_run == 0 {
            return Err(ArtworkError::Validation {
                field: "max_deletions_per_run".into(),
                message: "must be at least 1".into(),
            });
        }
        if let (Some(max), Some(target)) = (self.max_cache_bytes, self.target_cache_bytes) {
            if target > max {
                return Err(ArtworkError::Validation {
                    field: "target_cache_bytes".into(),
                    message: format!("{} exceeds max_cache_bytes {}", target, max),
                });
            }
        }
        if self.original_ttl < self.derived_ttl {
            return Err(ArtworkError::Validation {
                field: "original_ttl".into(),
                message: "originals must be retained at least as long as derived variants"
                    .into(),
            });
        }
        Ok(())
    }
}

/// Durations are written as whole or fractional seconds in config files.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_size_variant_roundtrip() {
        for size in SizeVariant::ALL {
            assert_eq!(size.as_str().parse::<SizeVariant>().unwrap(), size);
        }
        assert_eq!(" Thumb ".parse::<SizeVariant>().unwrap(), SizeVariant::Thumbnail);
        let err = "huge".parse::<SizeVariant>().unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(SizeVariant::normalize("huge"), SizeVariant::Medium);
    }

    #[test]
    fn test_size_targets() {
        assert_eq!(SizeVariant::Large.dimensions(), Some((192, 192)));
        assert_eq!(SizeVariant::Medium.dimensions(), Some((64, 64)));
        assert_eq!(SizeVariant::Small.dimensions(), Some((48, 48)));
        assert_eq!(SizeVariant::Thumbnail.dimensions(), Some((80, 80)));
        assert_eq!(SizeVariant::Original.dimensions(), None);
    }

    #[test]
    fn test_load_partial_config_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("artwork.json");
        std::fs::write(
            &path,
            r#"{ "cache_root": "/srv/art", "negative_ttl": 60, "crop_policy": "letterbox" }"#,
        )
        .unwrap();

        let config = ArtworkCacheConfig::load(&path).unwrap();
        assert_eq!(config.cache_root, PathBuf::from("/srv/art"));
        assert_eq!(config.negative_ttl, Duration::from_secs(60));
        assert_eq!(config.crop_policy, CropPolicy::Letterbox);
        assert_eq!(config.derived_ttl, CacheDefaults::DERIVED_TTL);
        assert_eq!(config.index_path(), PathBuf::from("/srv/art/artwork_index.sqlite"));
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ArtworkCacheConfig::load(&temp_dir.path().join("absent.json")).unwrap();
        assert_eq!(config.requests_per_second, 1.0);
    }

    #[test]
    fn test_validation_rejects_zero_rate() {
        let config = ArtworkCacheConfig {
            requests_per_second: 0.0,
            ..ArtworkCacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_root_url_prefix() {
        for prefix in ["", "/", "static/art"] {
            let config = ArtworkCacheConfig {
                url_prefix: prefix.to_string(),
                ..ArtworkCacheConfig::default()
            };
            assert!(config.validate().is_err(), "{:?}", prefix);
        }
        assert!(ArtworkCacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_of_size_cap() {
        let capped = ArtworkCacheConfig {
            max_cache_bytes: Some(1_000),
            target_cache_bytes: Some(800),
            ..ArtworkCacheConfig::default()
        };
        assert!(capped.validate().is_ok());

        let inverted = ArtworkCacheConfig {
            target_cache_bytes: Some(2_000),
            ..capped.clone()
        };
        assert!(inverted.validate().is_err());

        let no_deletions = ArtworkCacheConfig {
            max_deletions_per_run: 0,
            ..ArtworkCacheConfig::default()
        };
        assert!(no_deletions.validate().is_err());
    }
}
