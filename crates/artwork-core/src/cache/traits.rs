//! Asset index trait and types.

use crate::config::SizeVariant;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One cached file: the index row for an (album, size) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub album_id: i64,
    pub size_variant: SizeVariant,
    /// Hash of the source reference the file was produced from.
    pub cache_key: String,
    pub file_extension: String,
    pub byte_size: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl AssetRecord {
    /// File name inside the size tier directory.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.cache_key, self.file_extension)
    }
}

/// Why a source reference is negatively cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegativeKind {
    /// Upstream confirmed there is no artwork.
    NoArtwork,
    /// Upstream served bytes that are not a usable image.
    Malformed,
}

impl NegativeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegativeKind::NoArtwork => "no_artwork",
            NegativeKind::Malformed => "malformed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "no_artwork" => Some(NegativeKind::NoArtwork),
            "malformed" => Some(NegativeKind::Malformed),
            _ => None,
        }
    }
}

/// A remembered failed lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegativeEntry {
    pub cache_key: String,
    pub album_id: i64,
    pub kind: NegativeKind,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl NegativeEntry {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Index-side statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub asset_count: usize,
    pub total_bytes: u64,
    pub albums: usize,
    pub by_variant: BTreeMap<SizeVariant, usize>,
    pub negative_entries: usize,
}

/// Storage for asset and negative-lookup rows.
///
/// All operations are synchronous to match rusqlite's API; they are short
/// single-row statements and safe to call from async code.
pub trait AssetIndex: Send + Sync {
    /// Insert or replace the row for `(record.album_id, record.size_variant)`.
    fn upsert(&self, record: &AssetRecord) -> Result<()>;

    fn get(&self, album_id: i64, size: SizeVariant) -> Result<Option<AssetRecord>>;

    /// Bump `last_accessed_at`. Returns whether a row was updated.
    fn touch(&self, album_id: i64, size: SizeVariant, at: DateTime<Utc>) -> Result<bool>;

    /// Every indexed asset.
    fn list(&self) -> Result<Vec<AssetRecord>>;

    /// Every indexed variant of one album.
    fn list_album(&self, album_id: i64) -> Result<Vec<AssetRecord>>;

    /// Delete the row only if it still matches `expected` (same cache key
    /// and last access). Returns whether a row was deleted; `false` means it
    /// was replaced or read since `expected` was listed.
    fn remove_if(&self, expected: &AssetRecord) -> Result<bool>;

    /// Drop every asset and negative row of an album.
    fn remove_album(&self, album_id: i64) -> Result<usize>;

    /// Insert or replace a negative entry keyed by its cache key.
    fn record_negative(&self, entry: &NegativeEntry) -> Result<()>;

    /// The negative entry for `cache_key`, only if it has not expired.
    fn get_negative(&self, cache_key: &str, now: DateTime<Utc>) -> Result<Option<NegativeEntry>>;

    fn clear_negative(&self, cache_key: &str) -> Result<bool>;

    /// Delete expired negative entries. Returns the number removed.
    fn prune_negative(&self, now: DateTime<Utc>) -> Result<usize>;

    fn stats(&self) -> Result<IndexStats>;
}
