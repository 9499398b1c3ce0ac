//! Atomic file operations.
//!
//! Every write goes to a temp file created in the destination directory,
//! is fsynced, then renamed over the target. A reader either sees the old
//! file, the new file, or no file; never a partial one.

use crate::{ArtworkError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Prefix of in-flight temp files; the orphan sweep recognises it.
pub const TEMP_FILE_PREFIX: &str = ".artwork-";

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist, or an error if parsing fails.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ArtworkError::io_with_path(e, path)),
    };

    let data: T = serde_json::from_str(&contents).map_err(|e| ArtworkError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(data))
}

/// Write data to a JSON file atomically, optionally keeping a `.bak` of the
/// previous contents.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T, keep_backup: bool) -> Result<()> {
    let serialized = serde_json::to_vec_pretty(data).map_err(|e| ArtworkError::Json {
        message: format!("Failed to serialize {}: {}", path.display(), e),
        source: Some(e),
    })?;

    if keep_backup && path.exists() {
        let backup_path = path.with_extension("json.bak");
        if let Err(e) = fs::copy(path, &backup_path) {
            warn!("Failed to create backup {}: {}", backup_path.display(), e);
        }
    }

    atomic_write_bytes(path, &serialized)
}

/// Write raw bytes to `path` atomically.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| ArtworkError::Storage {
        message: "Target path has no parent directory".to_string(),
        path: Some(path.to_path_buf()),
        source: None,
    })?;
    fs::create_dir_all(parent).map_err(|e| ArtworkError::io_with_path(e, parent))?;

    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_FILE_PREFIX)
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|e| ArtworkError::io_with_path(e, parent))?;

    write_and_sync(&mut temp, bytes).map_err(|e| ArtworkError::io_with_path(e, temp.path()))?;

    temp.persist(path)
        .map_err(|e| ArtworkError::io_with_path(e.error, path))?;

    debug!("Atomically wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

fn write_and_sync(temp: &mut NamedTempFile, bytes: &[u8]) -> std::io::Result<()> {
    temp.write_all(bytes)?;
    temp.flush()?;
    temp.as_file().sync_all()
}

/// Remove a file, treating "already gone" as success. Returns whether a file
/// was actually removed.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ArtworkError::io_with_path(e, path)),
    }
}
