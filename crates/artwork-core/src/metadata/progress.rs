//! Migration checkpoint and report persistence.
//!
//! [`ProgressStore`] is the only component that reads or writes the checkpoint
//! and report files. Callers go through `begin`/`record`/`finish`, which merge
//! into the in-memory copy under a lock and write it back atomically, so the
//! on-disk progress always has exactly one writer.

use super::atomic::{atomic_read_json, atomic_write_json, remove_file_if_exists};
use crate::{ArtworkError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Lifecycle of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Aborted,
}

/// Durable checkpoint, rewritten after every album.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub total: usize,
    pub processed: usize,
    #[serde(default)]
    pub failed_album_ids: BTreeMap<i64, String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: MigrationState,
    #[serde(default)]
    pub cached: usize,
    #[serde(default)]
    pub bytes_cached: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

impl MigrationProgress {
    pub fn is_complete(&self) -> bool {
        self.processed >= self.total
    }
}

/// Summary written when a run finishes; overwritten per run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MigrationReport {
    pub cached: usize,
    pub failed: usize,
    pub bytes_cached: u64,
    pub processing_time_seconds: f64,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MigrationReport {
    /// Snapshot of a (possibly unfinished) checkpoint.
    pub fn from_progress(progress: &MigrationProgress, now: DateTime<Utc>) -> Self {
        let processing_time_seconds = progress
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);

        Self {
            cached: progress.cached,
            failed: progress.failed_album_ids.len(),
            bytes_cached: progress.bytes_cached,
            processing_time_seconds,
            completed_at: (progress.state == MigrationState::Completed).then_some(now),
        }
    }
}

/// Outcome of one album, merged into the checkpoint.
#[derive(Debug, Clone)]
pub enum AlbumOutcome {
    Cached { bytes: u64 },
    Failed { reason: String },
}

/// Single owner of the checkpoint and report files.
pub struct ProgressStore {
    progress_path: PathBuf,
    report_path: PathBuf,
    current: Mutex<Option<MigrationProgress>>,
}

impl ProgressStore {
    pub fn new(progress_path: impl Into<PathBuf>, report_path: impl Into<PathBuf>) -> Self {
        Self {
            progress_path: progress_path.into(),
            report_path: report_path.into(),
            current: Mutex::new(None),
        }
    }

    pub fn progress_path(&self) -> &Path {
        &self.progress_path
    }

    /// Read the checkpoint from disk.
    pub fn load(&self) -> Result<Option<MigrationProgress>> {
        atomic_read_json(&self.progress_path)
    }

    /// Read the last report from disk.
    pub fn load_report(&self) -> Result<Option<MigrationReport>> {
        atomic_read_json(&self.report_path)
    }

    /// Start or resume a run over a catalog of `total` albums.
    ///
    /// An existing checkpoint is resumed: `processed` is kept as-is and
    /// `total` can only grow to the current catalog size.
    pub fn begin(&self, total: usize) -> Result<MigrationProgress> {
        let mut progress = match self.load()? {
            Some(mut existing) => {
                info!(
                    "Resuming migration from checkpoint: {}/{} albums processed",
                    existing.processed, existing.total
                );
                existing.total = total.max(existing.processed);
                existing
            }
            None => MigrationProgress {
                total,
                started_at: Some(Utc::now()),
                ..MigrationProgress::default()
            },
        };

        progress.state = if progress.is_complete() {
            MigrationState::Completed
        } else {
            MigrationState::InProgress
        };
        progress.abort_reason = None;

        self.persist(&progress)?;
        *self.lock()? = Some(progress.clone());
        Ok(progress)
    }

    /// Merge the outcome of the album at `index` and write the checkpoint.
    ///
    /// Outcomes must arrive in catalog order: `index` has to equal the
    /// current `processed` count.
    pub fn record(&self, index: usize, album_id: i64, outcome: AlbumOutcome) -> Result<MigrationProgress> {
        let mut guard = self.lock()?;
        let progress = guard.as_mut().ok_or_else(|| ArtworkError::Other(
            "Migration progress recorded before begin()".to_string(),
        ))?;

        if index != progress.processed {
            return Err(ArtworkError::Validation {
                field: "index".into(),
                message: format!(
                    "out-of-order checkpoint: got album index {}, expected {}",
                    index, progress.processed
                ),
            });
        }

        match outcome {
            AlbumOutcome::Cached { bytes } => {
                progress.cached += 1;
                progress.bytes_cached += bytes;
            }
            AlbumOutcome::Failed { reason } => {
                progress.failed_album_ids.insert(album_id, reason);
            }
        }
        progress.processed += 1;
        if progress.is_complete() {
            progress.state = MigrationState::Completed;
        }

        self.persist(progress)?;
        debug!("Checkpoint saved: {}/{}", progress.processed, progress.total);
        Ok(progress.clone())
    }

    /// Close the run in `state` and write the report.
    pub fn finish(&self, state: MigrationState, abort_reason: Option<String>) -> Result<MigrationReport> {
        let mut guard = self.lock()?;
        let progress = guard.as_mut().ok_or_else(|| ArtworkError::Other(
            "Migration finished before begin()".to_string(),
        ))?;

        progress.state = state;
        progress.abort_reason = abort_reason;
        self.persist(progress)?;

        let report = MigrationReport::from_progress(progress, Utc::now());
        atomic_write_json(&self.report_path, &report, false)?;
        info!("Migration report written to {}", self.report_path.display());
        Ok(report)
    }

    /// Delete the checkpoint only. Cached assets and the last report stay.
    pub fn reset(&self) -> Result<bool> {
        *self.lock()? = None;
        let removed = remove_file_if_exists(&self.progress_path)?;
        remove_file_if_exists(&self.progress_path.with_extension("json.bak"))?;
        if removed {
            info!("Migration checkpoint reset: {}", self.progress_path.display());
        }
        Ok(removed)
    }

    fn persist(&self, progress: &MigrationProgress) -> Result<()> {
        atomic_write_json(&self.progress_path, progress, true)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<MigrationProgress>>> {
        self.current
            .lock()
            .map_err(|e| ArtworkError::Other(format!("Progress lock poisoned: {}", e)))
    }
}
