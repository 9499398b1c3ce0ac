//! Read-only view of the album catalog.
//!
//! The relational store that owns albums lives outside this crate; the cache
//! only needs album ids and each album's recorded artwork reference.

use crate::config::NetworkConfig;
use crate::error::{ArtworkError, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use url::Url;

/// An album as seen by the artwork cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumRecord {
    pub id: i64,
    pub musicbrainz_id: Option<String>,
    /// Cover URL recorded at import time; unverified.
    pub cover_art_url: Option<String>,
}

impl AlbumRecord {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            musicbrainz_id: None,
            cover_art_url: None,
        }
    }

    pub fn with_cover_url(mut self, url: impl Into<String>) -> Self {
        self.cover_art_url = Some(url.into());
        self
    }

    pub fn with_musicbrainz_id(mut self, mbid: impl Into<String>) -> Self {
        self.musicbrainz_id = Some(mbid.into());
        self
    }

    /// The recorded cover URL, if it is a usable http(s) URL.
    pub fn recorded_cover_url(&self) -> Option<&str> {
        let raw = self.cover_art_url.as_deref()?.trim();
        let parsed = Url::parse(raw).ok()?;
        matches!(parsed.scheme(), "http" | "https").then_some(raw)
    }

    /// Canonical artwork source reference: the recorded cover URL, else the
    /// Cover Art Archive front cover of the MusicBrainz release.
    pub fn source_reference(&self) -> Option<String> {
        if let Some(url) = self.recorded_cover_url() {
            return Some(url.to_string());
        }
        let mbid = self.musicbrainz_id.as_deref()?.trim();
        if mbid.is_empty() {
            return None;
        }
        Some(format!(
            "{}/{}/front",
            NetworkConfig::COVER_ART_ARCHIVE_BASE,
            mbid
        ))
    }
}

/// Read-only album lookup.
///
/// Operations are synchronous: the catalog is a local database and lookups
/// are cheap enough to run on the request path.
pub trait AlbumCatalog: Send + Sync {
    /// All album ids in ascending order. The order defines migration indices.
    fn album_ids(&self) -> Result<Vec<i64>>;

    fn get_album(&self, album_id: i64) -> Result<Option<AlbumRecord>>;
}

/// Catalog backed by the application's SQLite database, opened read-only.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
        )
        .map_err(|e| ArtworkError::Database {
            message: format!("Failed to open album catalog {}: {}", db_path.display(), e),
            source: Some(e),
        })?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| ArtworkError::Database {
            message: format!("Failed to lock catalog: {}", e),
            source: None,
        })
    }
}

impl AlbumCatalog for SqliteCatalog {
    fn album_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM albums ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn get_album(&self, album_id: i64) -> Result<Option<AlbumRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT id, musicbrainz_id, cover_art_url FROM albums WHERE id = ?1",
                params![album_id],
                |row| {
                    Ok(AlbumRecord {
                        id: row.get(0)?,
                        musicbrainz_id: row.get(1)?,
                        cover_art_url: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

/// In-memory catalog for embedding and tests.
#[derive(Default)]
pub struct StaticCatalog {
    albums: Mutex<BTreeMap<i64, AlbumRecord>>,
}

impl StaticCatalog {
    pub fn new(albums: impl IntoIterator<Item = AlbumRecord>) -> Self {
        Self {
            albums: Mutex::new(albums.into_iter().map(|a| (a.id, a)).collect()),
        }
    }

    /// Insert or replace an album, e.g. after its cover URL was corrected.
    pub fn upsert(&self, album: AlbumRecord) {
        if let Ok(mut albums) = self.albums.lock() {
            albums.insert(album.id, album);
        }
    }

    pub fn remove(&self, album_id: i64) {
        if let Ok(mut albums) = self.albums.lock() {
            albums.remove(&album_id);
        }
    }

    fn albums(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<i64, AlbumRecord>>> {
        self.albums
            .lock()
            .map_err(|e| ArtworkError::Other(format!("Catalog lock poisoned: {}", e)))
    }
}

impl AlbumCatalog for StaticCatalog {
    fn album_ids(&self) -> Result<Vec<i64>> {
        Ok(self.albums()?.keys().copied().collect())
    }

    fn get_album(&self, album_id: i64) -> Result<Option<AlbumRecord>> {
        Ok(self.albums()?.get(&album_id).cloned())
    }
}
