//! Migration job: run, status, reset.

use crate::cancel::CancellationToken;
use crate::catalog::AlbumCatalog;
use crate::error::{ArtworkError, Result};
use crate::metadata::{AlbumOutcome, MigrationProgress, MigrationReport, MigrationState, ProgressStore};
use crate::network::Priority;
use crate::pipeline::FetchPipeline;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::pin::pin;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Checkpoint and last report, as shown by the `status` command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationStatus {
    pub progress: Option<MigrationProgress>,
    pub report: Option<MigrationReport>,
}

impl MigrationStatus {
    pub fn state(&self) -> MigrationState {
        self.progress
            .as_ref()
            .map(|p| p.state)
            .unwrap_or(MigrationState::NotStarted)
    }

    pub fn is_complete(&self) -> bool {
        self.state() == MigrationState::Completed
    }
}

pub struct MigrationJob {
    catalog: Arc<dyn AlbumCatalog>,
    pipeline: Arc<FetchPipeline>,
    store: ProgressStore,
    concurrency: usize,
}

impl MigrationJob {
    pub fn new(
        catalog: Arc<dyn AlbumCatalog>,
        pipeline: Arc<FetchPipeline>,
        store: ProgressStore,
        concurrency: usize,
    ) -> Self {
        Self {
            catalog,
            pipeline,
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Start a new run or resume the checkpointed one.
    ///
    /// Per-album failures are recorded and skipped. The run aborts only when
    /// the checkpoint cannot be written or `cancel` fires; both leave the
    /// checkpoint at the last fully processed album.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<MigrationReport> {
        let album_ids = self.catalog.album_ids()?;
        let progress = self.store.begin(album_ids.len())?;

        if progress.is_complete() {
            info!(
                "Migration already complete ({}/{} albums)",
                progress.processed, progress.total
            );
            return self.store.finish(MigrationState::Completed, None);
        }

        let start = progress.processed;
        info!(
            "Migrating artwork for {} albums, starting at index {}",
            album_ids.len() - start,
            start
        );

        // `buffered` yields in input order, so checkpoints stay sequential
        // even when several albums are in flight.
        let mut outcomes = pin!(stream::iter(album_ids.into_iter().enumerate().skip(start))
            .map(move |(index, album_id)| async move {
                (index, album_id, self.process(album_id).await)
            })
            .buffered(self.concurrency));

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Migration cancelled");
                    return self.store.finish(MigrationState::Aborted, Some("cancelled".into()));
                }
                next = outcomes.next() => next,
            };
            let Some((index, album_id, outcome)) = next else {
                break;
            };

            match self.store.record(index, album_id, outcome) {
                Ok(progress) => {
                    if progress.processed % 25 == 0 || progress.is_complete() {
                        info!(
                            "Migration progress: {}/{} ({} failed)",
                            progress.processed,
                            progress.total,
                            progress.failed_album_ids.len()
                        );
                    }
                }
                Err(e) => {
                    error!("Failed to write migration checkpoint: {}", e);
                    if let Err(finish_err) = self
                        .store
                        .finish(MigrationState::Aborted, Some(format!("checkpoint write failed: {}", e)))
                    {
                        error!("Failed to record aborted migration: {}", finish_err);
                    }
                    return Err(e);
                }
            }
        }

        let report = self.store.finish(MigrationState::Completed, None)?;
        info!(
            "Migration complete: {} cached, {} failed, {} bytes in {:.1}s",
            report.cached, report.failed, report.bytes_cached, report.processing_time_seconds
        );
        Ok(report)
    }

    async fn process(&self, album_id: i64) -> AlbumOutcome {
        let album = match self.catalog.get_album(album_id) {
            Ok(Some(album)) => album,
            Ok(None) => {
                return Self::failed(&ArtworkError::AlbumNotFound { album_id });
            }
            Err(e) => return Self::failed(&e),
        };

        match self.pipeline.ensure_all(&album, Priority::Background).await {
            Ok(records) => {
                let bytes: u64 = records.iter().map(|r| r.byte_size).sum();
                debug!("Album {} cached ({} bytes)", album_id, bytes);
                AlbumOutcome::Cached { bytes }
            }
            Err(e) => Self::failed(&e),
        }
    }

    fn failed(err: &ArtworkError) -> AlbumOutcome {
        AlbumOutcome::Failed {
            reason: format!("{}: {}", err.kind(), err),
        }
    }

    /// Current checkpoint and report. While a run is in progress the report
    /// is a snapshot of the checkpoint; otherwise it is the last one written.
    pub fn status(&self) -> Result<MigrationStatus> {
        let progress = self.store.load()?;
        let report = match &progress {
            Some(p) if p.state == MigrationState::InProgress => {
                Some(MigrationReport::from_progress(p, Utc::now()))
            }
            _ => self.store.load_report()?,
        };
        Ok(MigrationStatus { progress, report })
    }

    /// Delete the checkpoint. Cached assets are untouched.
    pub fn reset(&self) -> Result<bool> {
        self.store.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteAssetIndex;
    use crate::catalog::{AlbumRecord, StaticCatalog};
    use crate::config::ArtworkCacheConfig;
    use crate::layout::CacheLayout;
    use crate::network::{ArtworkSource, FetchLimiter, FetchedArtwork};
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Source {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ArtworkSource for Source {
        async fn fetch(&self, album_id: i64, url: &str) -> Result<FetchedArtwork> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if album_id % 5 == 0 {
                return Err(ArtworkError::MalformedAsset {
                    url: url.into(),
                    message: "corrupt".into(),
                });
            }
            let mut buf = Cursor::new(Vec::new());
            image::DynamicImage::new_rgb8(64, 64)
                .write_to(&mut buf, image::ImageFormat::Png)
                .unwrap();
            Ok(FetchedArtwork {
                bytes: buf.into_inner(),
                content_type: None,
            })
        }
    }

    fn job(dir: &TempDir, albums: usize, source: Arc<Source>) -> MigrationJob {
        let config = ArtworkCacheConfig::with_root(dir.path());
        let layout = CacheLayout::new(dir.path(), "/art");
        layout.ensure_directories().unwrap();
        let pipeline = FetchPipeline::new(
            &config,
            layout,
            Arc::new(SqliteAssetIndex::open(config.index_path()).unwrap()),
            source,
            Arc::new(FetchLimiter::new(1000.0).unwrap()),
        );
        let catalog = StaticCatalog::new((1..=albums as i64).map(|id| {
            AlbumRecord::new(id).with_cover_url(format!("https://img.example.org/{}.png", id))
        }));
        MigrationJob::new(
            Arc::new(catalog),
            Arc::new(pipeline),
            ProgressStore::new(&config.progress_file, &config.report_file),
            2,
        )
    }

    #[tokio::test]
    async fn test_failures_do_not_block_completion() {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(Source {
            calls: AtomicUsize::new(0),
        });
        let job = job(&temp_dir, 10, source.clone());

        let report = job.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.cached, 8);
        assert_eq!(report.failed, 2);
        assert!(report.completed_at.is_some());

        let status = job.status().unwrap();
        assert!(status.is_complete());
        let progress = status.progress.unwrap();
        assert_eq!(progress.processed, 10);
        assert!(progress.failed_album_ids[&5].starts_with("malformed_asset"));
    }

    #[tokio::test]
    async fn test_reset_rerun_short_circuits_on_cached_assets() {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(Source {
            calls: AtomicUsize::new(0),
        });
        let job = job(&temp_dir, 6, source.clone());
        job.run(&CancellationToken::new()).await.unwrap();
        let first_pass = source.calls.load(Ordering::SeqCst);

        assert!(job.reset().unwrap());
        assert_eq!(job.status().unwrap().state(), MigrationState::NotStarted);

        let report = job.run(&CancellationToken::new()).await.unwrap();
        // Cached albums and the negatively cached one need no new requests
        assert_eq!(source.calls.load(Ordering::SeqCst), first_pass);
        assert_eq!(report.cached, 5);
    }

    #[tokio::test]
    async fn test_status_snapshots_a_run_in_progress() {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(Source {
            calls: AtomicUsize::new(0),
        });
        let job = job(&temp_dir, 6, source);
        job.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(job.status().unwrap().report.unwrap().cached, 5);

        // A fresh run, one album in: the finished run's report must not show
        job.reset().unwrap();
        job.store.begin(6).unwrap();
        job.store
            .record(0, 1, AlbumOutcome::Cached { bytes: 100 })
            .unwrap();

        let status = job.status().unwrap();
        assert_eq!(status.state(), MigrationState::InProgress);
        let report = status.report.unwrap();
        assert_eq!(report.cached, 1);
        assert_eq!(report.bytes_cached, 100);
        assert!(report.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_run_is_aborted() {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(Source {
            calls: AtomicUsize::new(0),
        });
        let job = job(&temp_dir, 4, source);
        let cancel = CancellationToken::new();
        cancel.cancel();

        job.run(&cancel).await.unwrap();
        let progress = job.status().unwrap().progress.unwrap();
        assert_eq!(progress.state, MigrationState::Aborted);
        assert_eq!(progress.processed, 0);
    }
}
