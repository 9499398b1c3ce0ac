//! Durable file persistence.
//!
//! This module provides:
//! - Atomic JSON and byte writes (temp file + fsync + rename)
//! - The migration checkpoint and report store

mod atomic;
mod progress;

pub use atomic::{
    atomic_read_json, atomic_write_bytes, atomic_write_json, remove_file_if_exists,
    TEMP_FILE_PREFIX,
};
pub use progress::{AlbumOutcome, MigrationProgress, MigrationReport, MigrationState, ProgressStore};
