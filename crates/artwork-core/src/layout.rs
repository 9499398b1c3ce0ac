//! Key and on-disk layout of the artwork cache.
//!
//! ```text
//! <cache_root>/{original|large|medium|small|thumbnail}/<cache_key>.<ext>
//! ```
//!
//! The cache key hashes the album's artwork source reference, never the image
//! bytes, so it is known before anything is fetched. A changed reference
//! yields a new key and the previous file is left for the eviction sweep.

use crate::catalog::AlbumRecord;
use crate::config::SizeVariant;
use crate::error::{ArtworkError, Result};
use crate::metadata::TEMP_FILE_PREFIX;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Hex characters kept from the SHA-256 digest (128 bits).
const CACHE_KEY_LEN: usize = 32;

/// Extension of every derived variant.
pub const DERIVED_EXTENSION: &str = "jpg";

/// Per-tier file statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierStatistics {
    pub files: usize,
    pub bytes: u64,
}

/// File statistics across the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub total_files: usize,
    pub total_bytes: u64,
    pub by_variant: BTreeMap<SizeVariant, TierStatistics>,
}

/// Maps (album, size) to storage paths and public URLs.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
    url_prefix: String,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cache key for an album's source reference.
    ///
    /// The album id is part of the hash input so two albums sharing one
    /// cover URL still own separate files.
    pub fn cache_key(album_id: i64, source_reference: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(album_id.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(source_reference.trim().as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..CACHE_KEY_LEN].to_string()
    }

    /// Current cache key of an album, `None` if it has no artwork reference.
    pub fn key_for(album: &AlbumRecord) -> Option<String> {
        album
            .source_reference()
            .map(|reference| Self::cache_key(album.id, &reference))
    }

    pub fn tier_dir(&self, size: SizeVariant) -> PathBuf {
        self.root.join(size.as_str())
    }

    pub fn path(&self, size: SizeVariant, cache_key: &str, extension: &str) -> PathBuf {
        let extension = extension.trim_start_matches('.');
        self.tier_dir(size).join(format!("{}.{}", cache_key, extension))
    }

    /// Storage path for an album's variant. Pure; touches no files.
    pub fn resolve(&self, album: &AlbumRecord, size: SizeVariant, extension: &str) -> Option<PathBuf> {
        Self::key_for(album).map(|key| self.path(size, &key, extension))
    }

    /// Public URL of a cached file.
    pub fn url(&self, size: SizeVariant, cache_key: &str, extension: &str) -> String {
        format!(
            "{}/{}/{}.{}",
            self.url_prefix,
            size.as_str(),
            cache_key,
            extension.trim_start_matches('.')
        )
    }

    /// Split `<cache_key>.<ext>` into its parts. Temp files are not assets.
    pub fn parse_file_name(name: &str) -> Option<(&str, &str)> {
        if name.starts_with(TEMP_FILE_PREFIX) || name.starts_with('.') {
            return None;
        }
        let (stem, ext) = name.rsplit_once('.')?;
        (!stem.is_empty() && !ext.is_empty()).then_some((stem, ext))
    }

    /// Create the root and every tier directory.
    pub fn ensure_directories(&self) -> Result<()> {
        for size in SizeVariant::ALL {
            let dir = self.tier_dir(size);
            fs::create_dir_all(&dir).map_err(|e| ArtworkError::io_with_path(e, &dir))?;
        }
        debug!("Artwork cache directories ready at {}", self.root.display());
        Ok(())
    }

    /// Check that every tier directory exists and is writable.
    pub fn verify_structure(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !self.root.is_dir() {
            issues.push(format!("Base directory missing: {}", self.root.display()));
        }
        for size in SizeVariant::ALL {
            let dir = self.tier_dir(size);
            match fs::metadata(&dir) {
                Ok(meta) if !meta.is_dir() => {
                    issues.push(format!("Not a directory: {}", dir.display()))
                }
                Ok(meta) if meta.permissions().readonly() => {
                    issues.push(format!("Directory not writable: {}", dir.display()))
                }
                Ok(_) => {}
                Err(_) => issues.push(format!("Missing directory: {}", dir.display())),
            }
        }
        issues
    }

    /// Verify the structure and recreate what is missing.
    pub fn repair(&self) -> Result<()> {
        let issues = self.verify_structure();
        if issues.is_empty() {
            info!("Artwork cache structure verified at {}", self.root.display());
            return Ok(());
        }
        warn!("Artwork cache structure issues found: {:?}", issues);
        self.ensure_directories()
    }

    /// Walk the tier directories and count asset files.
    pub fn statistics(&self) -> CacheStatistics {
        let mut stats = CacheStatistics::default();
        for size in SizeVariant::ALL {
            let mut tier = TierStatistics::default();
            for entry in self.tier_files(size) {
                tier.files += 1;
                tier.bytes += entry.size;
            }
            stats.total_files += tier.files;
            stats.total_bytes += tier.bytes;
            stats.by_variant.insert(size, tier);
        }
        stats
    }

    /// Files currently present in a tier, including in-flight temp files.
    pub fn tier_files(&self, size: SizeVariant) -> Vec<TierFile> {
        WalkDir::new(self.tier_dir(size))
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                Some(TierFile {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    path: entry.into_path(),
                    size: meta.len(),
                    modified: meta.modified().ok(),
                })
            })
            .collect()
    }
}

/// A file found in a tier directory.
#[derive(Debug, Clone)]
pub struct TierFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<std::time::SystemTime>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cache_key_is_deterministic() {
        let a = CacheLayout::cache_key(42, "https://example.org/cover.jpg");
        let b = CacheLayout::cache_key(42, "https://example.org/cover.jpg");
        assert_eq!(a, b);
        assert_eq!(a.len(), CACHE_KEY_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_changed_reference_changes_key() {
        let old = CacheLayout::cache_key(42, "https://example.org/old.jpg");
        let new = CacheLayout::cache_key(42, "https://example.org/new.jpg");
        assert_ne!(old, new);
        assert_ne!(
            CacheLayout::cache_key(1, "https://example.org/shared.jpg"),
            CacheLayout::cache_key(2, "https://example.org/shared.jpg")
        );
    }

    #[test]
    fn test_resolve_path_and_url() {
        let layout = CacheLayout::new("/srv/cache", "/static/artwork_cache/");
        let album = AlbumRecord::new(42).with_cover_url("https://example.org/cover.jpg");
        let key = CacheLayout::key_for(&album).unwrap();

        assert_eq!(
            layout.resolve(&album, SizeVariant::Medium, "jpg").unwrap(),
            PathBuf::from(format!("/srv/cache/medium/{}.jpg", key))
        );
        assert_eq!(
            layout.url(SizeVariant::Large, &key, ".png"),
            format!("/static/artwork_cache/large/{}.png", key)
        );
        assert!(layout.resolve(&AlbumRecord::new(1), SizeVariant::Small, "jpg").is_none());
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(CacheLayout::parse_file_name("abc.jpg"), Some(("abc", "jpg")));
        assert_eq!(CacheLayout::parse_file_name(".artwork-x1.tmp"), None);
        assert_eq!(CacheLayout::parse_file_name(".gitkeep"), None);
        assert_eq!(CacheLayout::parse_file_name("noext"), None);
    }

    #[test]
    fn test_repair_and_statistics() {
        let temp_dir = TempDir::new().unwrap();
        let layout = CacheLayout::new(temp_dir.path().join("cache"), "/art");
        assert!(!layout.verify_structure().is_empty());

        layout.repair().unwrap();
        assert!(layout.verify_structure().is_empty());

        fs::write(layout.path(SizeVariant::Small, "k1", "jpg"), vec![0u8; 10]).unwrap();
        fs::write(layout.path(SizeVariant::Original, "k1", "png"), vec![0u8; 30]).unwrap();

        let stats = layout.statistics();
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.total_bytes, 40);
        assert_eq!(stats.by_variant[&SizeVariant::Small].files, 1);
        assert_eq!(stats.by_variant[&SizeVariant::Medium].files, 0);
    }
}
