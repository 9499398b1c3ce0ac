//! SQLite-backed asset index.

use super::traits::{AssetIndex, AssetRecord, IndexStats, NegativeEntry, NegativeKind};
use crate::config::SizeVariant;
use crate::error::{ArtworkError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// SQLite asset index.
///
/// Thread-safe via internal mutex on the connection.
pub struct SqliteAssetIndex {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAssetIndex {
    /// Open (or create) the index at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ArtworkError::Storage {
                message: format!("Failed to create index directory: {}", e),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }

        let conn = Connection::open(db_path).map_err(|e| ArtworkError::Database {
            message: format!("Failed to open asset index: {}", e),
            source: Some(e),
        })?;

        // WAL lets the eviction sweep read while the pipeline writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| ArtworkError::Database {
                message: format!("Failed to set pragmas: {}", e),
                source: Some(e),
            })?;

        Self::from_connection(conn)
    }

    /// In-memory index, used by tests and throwaway tooling.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let index = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS artwork_assets (
                album_id INTEGER NOT NULL,
                size_variant TEXT NOT NULL,
                cache_key TEXT NOT NULL,
                file_extension TEXT NOT NULL,
                byte_size INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                last_accessed_at TEXT NOT NULL,
                PRIMARY KEY (album_id, size_variant)
            );

            CREATE INDEX IF NOT EXISTS idx_assets_accessed
                ON artwork_assets(size_variant, last_accessed_at);

            CREATE TABLE IF NOT EXISTS negative_lookups (
                cache_key TEXT PRIMARY KEY,
                album_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                reason TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_negative_album
                ON negative_lookups(album_id);
            "#,
        )
        .map_err(|e| ArtworkError::Database {
            message: format!("Failed to initialize index schema: {}", e),
            source: Some(e),
        })?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| ArtworkError::Database {
            message: format!("Failed to lock database: {}", e),
            source: None,
        })
    }
}

// Fixed-width UTC timestamps sort lexicographically, so range queries can
// compare the TEXT columns directly.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn asset_from_row(row: &Row<'_>) -> rusqlite::Result<Option<AssetRecord>> {
    let size: String = row.get(1)?;
    let Ok(size_variant) = size.parse::<SizeVariant>() else {
        return Ok(None);
    };
    let byte_size: i64 = row.get(4)?;
    let created_at: String = row.get(5)?;
    let last_accessed_at: String = row.get(6)?;
    Ok(Some(AssetRecord {
        album_id: row.get(0)?,
        size_variant,
        cache_key: row.get(2)?,
        file_extension: row.get(3)?,
        byte_size: byte_size.max(0) as u64,
        created_at: parse_ts(&created_at),
        last_accessed_at: parse_ts(&last_accessed_at),
    }))
}

fn negative_from_row(row: &Row<'_>) -> rusqlite::Result<Option<NegativeEntry>> {
    let kind: String = row.get(2)?;
    let Some(kind) = NegativeKind::parse(&kind) else {
        return Ok(None);
    };
    let recorded_at: String = row.get(4)?;
    let expires_at: String = row.get(5)?;
    Ok(Some(NegativeEntry {
        cache_key: row.get(0)?,
        album_id: row.get(1)?,
        kind,
        reason: row.get(3)?,
        recorded_at: parse_ts(&recorded_at),
        expires_at: parse_ts(&expires_at),
    }))
}

const ASSET_COLUMNS: &str =
    "album_id, size_variant, cache_key, file_extension, byte_size, created_at, last_accessed_at";

impl AssetIndex for SqliteAssetIndex {
    fn upsert(&self, record: &AssetRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO artwork_assets
            (album_id, size_variant, cache_key, file_extension, byte_size, created_at, last_accessed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.album_id,
                record.size_variant.as_str(),
                record.cache_key,
                record.file_extension,
                record.byte_size as i64,
                format_ts(record.created_at),
                format_ts(record.last_accessed_at),
            ],
        )
        .map_err(|e| ArtworkError::Database {
            message: format!("Failed to upsert asset: {}", e),
            source: Some(e),
        })?;
        Ok(())
    }

    fn get(&self, album_id: i64, size: SizeVariant) -> Result<Option<AssetRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM artwork_assets WHERE album_id = ?1 AND size_variant = ?2",
                    ASSET_COLUMNS
                ),
                params![album_id, size.as_str()],
                asset_from_row,
            )
            .optional()?;
        Ok(record.flatten())
    }

    fn touch(&self, album_id: i64, size: SizeVariant, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE artwork_assets SET last_accessed_at = ?1 WHERE album_id = ?2 AND size_variant = ?3",
            params![format_ts(at), album_id, size.as_str()],
        )?;
        Ok(updated > 0)
    }

    fn list(&self) -> Result<Vec<AssetRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM artwork_assets ORDER BY album_id, size_variant",
            ASSET_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], asset_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().flatten().collect())
    }

    fn list_album(&self, album_id: i64) -> Result<Vec<AssetRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM artwork_assets WHERE album_id = ?1",
            ASSET_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![album_id], asset_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().flatten().collect())
    }

    fn remove_if(&self, expected: &AssetRecord) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            r#"
            DELETE FROM artwork_assets
            WHERE album_id = ?1 AND size_variant = ?2
              AND cache_key = ?3 AND last_accessed_at = ?4
            "#,
            params![
                expected.album_id,
                expected.size_variant.as_str(),
                expected.cache_key,
                format_ts(expected.last_accessed_at),
            ],
        )?;
        Ok(deleted > 0)
    }

    fn remove_album(&self, album_id: i64) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let assets = tx.execute(
            "DELETE FROM artwork_assets WHERE album_id = ?1",
            params![album_id],
        )?;
        tx.execute(
            "DELETE FROM negative_lookups WHERE album_id = ?1",
            params![album_id],
        )?;
        tx.commit()?;
        debug!("Removed {} index rows for album {}", assets, album_id);
        Ok(assets)
    }

    fn record_negative(&self, entry: &NegativeEntry) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO negative_lookups
            (cache_key, album_id, kind, reason, recorded_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entry.cache_key,
                entry.album_id,
                entry.kind.as_str(),
                entry.reason,
                format_ts(entry.recorded_at),
                format_ts(entry.expires_at),
            ],
        )
        .map_err(|e| ArtworkError::Database {
            message: format!("Failed to record negative lookup: {}", e),
            source: Some(e),
        })?;
        Ok(())
    }

    fn get_negative(&self, cache_key: &str, now: DateTime<Utc>) -> Result<Option<NegativeEntry>> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                r#"
                SELECT cache_key, album_id, kind, reason, recorded_at, expires_at
                FROM negative_lookups
                WHERE cache_key = ?1 AND expires_at > ?2
                "#,
                params![cache_key, format_ts(now)],
                negative_from_row,
            )
            .optional()?;
        Ok(entry.flatten())
    }

    fn clear_negative(&self, cache_key: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM negative_lookups WHERE cache_key = ?1",
            params![cache_key],
        )?;
        Ok(deleted > 0)
    }

    fn prune_negative(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM negative_lookups WHERE expires_at <= ?1",
            params![format_ts(now)],
        )?;
        if deleted > 0 {
            debug!("Pruned {} expired negative lookups", deleted);
        }
        Ok(deleted)
    }

    fn stats(&self) -> Result<IndexStats> {
        let conn = self.conn()?;

        let (asset_count, total_bytes, albums): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(byte_size), 0), COUNT(DISTINCT album_id) FROM artwork_assets",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let negative_entries: i64 =
            conn.query_row("SELECT COUNT(*) FROM negative_lookups", [], |row| row.get(0))?;

        let mut stats = IndexStats {
            asset_count: asset_count as usize,
            total_bytes: total_bytes.max(0) as u64,
            albums: albums as usize,
            negative_entries: negative_entries as usize,
            ..IndexStats::default()
        };

        let mut stmt = conn.prepare(
            "SELECT size_variant, COUNT(*) FROM artwork_assets GROUP BY size_variant",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (size, count) = row?;
            if let Ok(size) = size.parse::<SizeVariant>() {
                stats.by_variant.insert(size, count as usize);
            }
        }

        Ok(stats)
    }
}
