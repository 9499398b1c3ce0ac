//! Asset index for the artwork cache.
//!
//! Tracks which (album, size) variants are on disk, when they were last read,
//! and which source references are known to have no usable artwork. The files
//! themselves live under the cache root; the index is the bookkeeping beside
//! them, stored in a single SQLite database.

mod sqlite;
mod traits;

pub use sqlite::SqliteAssetIndex;
pub use traits::{AssetIndex, AssetRecord, IndexStats, NegativeEntry, NegativeKind};
