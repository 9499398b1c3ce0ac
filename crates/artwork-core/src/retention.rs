//! Retention and eviction.
//!
//! Derived variants are a pure cache of (original, render policy) and go once
//! unread for `derived_ttl`. Originals are the expensive part: one is removed
//! only when it is itself past `original_ttl` and no derived sibling was read
//! within `derived_ttl`.
//!
//! A sweep also drops index rows whose file is gone, shrinks the cache to its
//! target when a size cap is configured (least recently read first, derived
//! before originals, never anything created within `recent_grace`), removes
//! files no index row points at once older than the orphan grace period, and
//! prunes expired negative lookups.
//!
//! Rows are deleted with a compare-and-delete against the listed snapshot, so
//! a variant that was re-fetched or read while the sweep ran is kept. Every
//! removal is best-effort.

use crate::cache::{AssetIndex, AssetRecord};
use crate::cancel::CancellationToken;
use crate::config::{ArtworkCacheConfig, CacheDefaults, SizeVariant};
use crate::error::Result;
use crate::layout::CacheLayout;
use crate::metadata::{remove_file_if_exists, TEMP_FILE_PREFIX};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Thresholds and limits for the sweep.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub derived_ttl: Duration,
    pub original_ttl: Duration,
    pub orphan_grace: Duration,
    pub recent_grace: Duration,
    pub max_cache_bytes: Option<u64>,
    pub target_cache_bytes: Option<u64>,
    pub max_deletions: usize,
}

impl RetentionPolicy {
    pub fn from_config(config: &ArtworkCacheConfig) -> Self {
        Self {
            derived_ttl: config.derived_ttl,
            original_ttl: config.original_ttl,
            orphan_grace: config.orphan_grace,
            recent_grace: config.recent_grace,
            max_cache_bytes: config.max_cache_bytes,
            target_cache_bytes: config.target_cache_bytes,
            max_deletions: config.max_deletions_per_run,
        }
    }

    /// Size a capped sweep shrinks to.
    fn size_target(&self, max: u64) -> u64 {
        self.target_cache_bytes
            .unwrap_or((max as f64 * CacheDefaults::TARGET_CACHE_RATIO) as u64)
            .min(max)
    }
}

/// Per-run switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictOptions {
    /// Report what would be removed without touching files or the index.
    pub dry_run: bool,
}

/// Outcome of one sweep. In a dry run the counts are what would have been
/// removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvictionReport {
    pub dry_run: bool,
    /// Indexed assets removed for being idle past their TTL.
    pub removed: usize,
    /// Index rows dropped because their file was gone.
    pub invalid_removed: usize,
    /// Indexed assets removed to bring the cache under its size cap.
    pub size_evicted: usize,
    pub bytes_freed: u64,
    pub orphans_removed: usize,
    pub negative_pruned: usize,
    /// Indexed bytes left after the sweep.
    pub cache_bytes: u64,
    /// The per-run deletion limit stopped the sweep early.
    pub deletion_limit_reached: bool,
    /// Removals that failed; the sweep carried on past them.
    pub errors: Vec<String>,
}

impl EvictionReport {
    fn total_removed(&self) -> usize {
        self.removed + self.invalid_removed + self.size_evicted
    }
}

#[derive(Debug, Clone, Copy)]
enum Removal {
    Expired,
    Invalid,
    OverSize,
}

/// Running state of one sweep.
struct Sweep {
    report: EvictionReport,
    budget: usize,
}

impl Sweep {
    fn has_budget(&mut self) -> bool {
        if self.budget == 0 {
            self.report.deletion_limit_reached = true;
        }
        self.budget > 0
    }
}

fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

pub struct Evictor {
    layout: CacheLayout,
    index: Arc<dyn AssetIndex>,
    policy: RetentionPolicy,
}

impl Evictor {
    pub fn new(layout: CacheLayout, index: Arc<dyn AssetIndex>, policy: RetentionPolicy) -> Self {
        Self {
            layout,
            index,
            policy,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Run one sweep as of `now`.
    pub fn evict(&self, now: DateTime<Utc>) -> Result<EvictionReport> {
        self.evict_with(now, EvictOptions::default())
    }

    pub fn evict_with(&self, now: DateTime<Utc>, options: EvictOptions) -> Result<EvictionReport> {
        let mut sweep = Sweep {
            report: EvictionReport {
                dry_run: options.dry_run,
                ..EvictionReport::default()
            },
            budget: self.policy.max_deletions,
        };

        let mut live: Vec<AssetRecord> = Vec::new();
        for record in self.index.list()? {
            if self.asset_path(&record).is_file() {
                live.push(record);
            } else if sweep.has_budget() {
                debug!(
                    "Dropping index row for album {} ({}): file is missing",
                    record.album_id, record.size_variant
                );
                self.remove_listed(&record, Removal::Invalid, &mut sweep, options);
            }
        }

        let mut kept = self.evict_expired(now, live, &mut sweep, options);
        self.enforce_size_cap(now, &mut kept, &mut sweep, options);
        sweep.report.cache_bytes = kept.iter().map(|r| r.byte_size).sum();

        if !options.dry_run {
            match self.index.prune_negative(now) {
                Ok(pruned) => sweep.report.negative_pruned = pruned,
                Err(e) => sweep
                    .report
                    .errors
                    .push(format!("negative lookup prune: {}", e)),
            }
        }

        self.sweep_orphans(now, &mut sweep.report, options)?;

        let report = sweep.report;
        if report.total_removed() + report.orphans_removed > 0 || !report.errors.is_empty() {
            info!(
                "Eviction{} removed {} expired, {} invalid and {} over-cap assets and {} orphans ({} bytes), {} errors",
                if report.dry_run { " (dry run)" } else { "" },
                report.removed,
                report.invalid_removed,
                report.size_evicted,
                report.orphans_removed,
                report.bytes_freed,
                report.errors.len()
            );
        }
        if report.deletion_limit_reached {
            warn!(
                "Eviction stopped at the limit of {} deletions; the next sweep continues",
                self.policy.max_deletions
            );
        }
        Ok(report)
    }

    /// Age-based expiry. Returns the records that stay.
    fn evict_expired(
        &self,
        now: DateTime<Utc>,
        live: Vec<AssetRecord>,
        sweep: &mut Sweep,
        options: EvictOptions,
    ) -> Vec<AssetRecord> {
        let mut by_album: BTreeMap<i64, Vec<AssetRecord>> = BTreeMap::new();
        for record in live {
            by_album.entry(record.album_id).or_default().push(record);
        }

        let mut kept = Vec::new();
        for (album_id, records) in by_album {
            let sibling_recently_read = records.iter().any(|r| {
                r.size_variant.is_derived()
                    && age(now, r.last_accessed_at) <= self.policy.derived_ttl
            });

            for record in records {
                let idle = age(now, record.last_accessed_at);
                let expired = if record.size_variant.is_derived() {
                    idle > self.policy.derived_ttl
                } else {
                    idle > self.policy.original_ttl && !sibling_recently_read
                };
                if expired && sweep.has_budget() {
                    debug!(
                        "Evicting {} variant of album {} (idle {} days)",
                        record.size_variant,
                        album_id,
                        idle.as_secs() / 86_400
                    );
                    if self.remove_listed(&record, Removal::Expired, sweep, options) {
                        continue;
                    }
                }
                kept.push(record);
            }
        }
        kept
    }

    /// Shrink to the size target once total indexed bytes exceed the cap.
    fn enforce_size_cap(
        &self,
        now: DateTime<Utc>,
        kept: &mut Vec<AssetRecord>,
        sweep: &mut Sweep,
        options: EvictOptions,
    ) {
        let Some(max) = self.policy.max_cache_bytes else {
            return;
        };
        let mut total: u64 = kept.iter().map(|r| r.byte_size).sum();
        if total <= max {
            debug!("Artwork cache ({} bytes) is within its cap of {}", total, max);
            return;
        }
        let target = self.policy.size_target(max);
        info!(
            "Artwork cache is {} bytes, over its cap of {}; shrinking to {}",
            total, max, target
        );

        // Derived variants first, then originals; least recently read first
        kept.sort_by_key(|r| (!r.size_variant.is_derived(), r.last_accessed_at));
        let mut survivors = Vec::with_capacity(kept.len());
        for record in kept.drain(..) {
            let removable = total > target
                && age(now, record.created_at) > self.policy.recent_grace
                && sweep.has_budget();
            if removable && self.remove_listed(&record, Removal::OverSize, sweep, options) {
                total = total.saturating_sub(record.byte_size);
                continue;
            }
            survivors.push(record);
        }
        *kept = survivors;

        if total > target {
            warn!(
                "Artwork cache still {} bytes after size eviction (target {}); remaining assets are recent",
                total, target
            );
        }
    }

    /// Remove every variant of an album, e.g. after it was deleted upstream.
    /// Unlike a sweep this is unconditional; files that cannot be removed are
    /// left to the orphan sweep.
    pub fn purge_album(&self, album_id: i64) -> Result<EvictionReport> {
        let mut report = EvictionReport::default();
        for record in self.index.list_album(album_id)? {
            let path = self.asset_path(&record);
            match remove_file_if_exists(&path) {
                Ok(true) => report.bytes_freed += record.byte_size,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to remove {}: {}", path.display(), e);
                    report.errors.push(format!("{}: {}", path.display(), e));
                }
            }
        }
        // Also drops the album's negative lookups
        report.removed = self.index.remove_album(album_id)?;
        info!(
            "Purged album {} from artwork cache ({} files, {} bytes)",
            album_id, report.removed, report.bytes_freed
        );
        Ok(report)
    }

    fn asset_path(&self, record: &AssetRecord) -> PathBuf {
        self.layout
            .path(record.size_variant, &record.cache_key, &record.file_extension)
    }

    /// Delete the row if it is unchanged since it was listed, then its file.
    /// Returns whether the asset counts as removed.
    fn remove_listed(
        &self,
        record: &AssetRecord,
        removal: Removal,
        sweep: &mut Sweep,
        options: EvictOptions,
    ) -> bool {
        let path = self.asset_path(record);
        let report = &mut sweep.report;

        if !options.dry_run {
            match self.index.remove_if(record) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        "Keeping album {} ({}): changed since the sweep listed it",
                        record.album_id, record.size_variant
                    );
                    return false;
                }
                Err(e) => {
                    report.errors.push(format!("{}: {}", path.display(), e));
                    return false;
                }
            }
        }
        sweep.budget = sweep.budget.saturating_sub(1);

        if !matches!(removal, Removal::Invalid) {
            let freed = if options.dry_run {
                Ok(path.is_file())
            } else {
                remove_file_if_exists(&path)
            };
            match freed {
                Ok(true) => report.bytes_freed += record.byte_size,
                Ok(false) => {}
                // The row is gone; the orphan sweep retries the file
                Err(e) => {
                    warn!("Failed to evict {}: {}", path.display(), e);
                    report.errors.push(format!("{}: {}", path.display(), e));
                }
            }
        }

        match removal {
            Removal::Expired => report.removed += 1,
            Removal::Invalid => report.invalid_removed += 1,
            Removal::OverSize => report.size_evicted += 1,
        }
        true
    }

    fn sweep_orphans(
        &self,
        now: DateTime<Utc>,
        report: &mut EvictionReport,
        options: EvictOptions,
    ) -> Result<()> {
        let indexed: HashSet<(SizeVariant, String)> = self
            .index
            .list()?
            .into_iter()
            .map(|r| (r.size_variant, r.file_name()))
            .collect();

        for size in SizeVariant::ALL {
            for file in self.layout.tier_files(size) {
                let is_temp = file.name.starts_with(TEMP_FILE_PREFIX);
                let is_asset = CacheLayout::parse_file_name(&file.name).is_some();
                if !is_temp && (!is_asset || indexed.contains(&(size, file.name.clone()))) {
                    continue;
                }

                let Some(modified) = file.modified else {
                    continue;
                };
                if age(now, DateTime::<Utc>::from(modified)) <= self.policy.orphan_grace {
                    continue;
                }

                if options.dry_run {
                    report.orphans_removed += 1;
                    report.bytes_freed += file.size;
                    continue;
                }
                match remove_file_if_exists(&file.path) {
                    Ok(true) => {
                        debug!("Removed orphaned cache file {}", file.path.display());
                        report.orphans_removed += 1;
                        report.bytes_freed += file.size;
                    }
                    Ok(false) => {}
                    Err(e) => report
                        .errors
                        .push(format!("{}: {}", file.path.display(), e)),
                }
            }
        }
        Ok(())
    }
}

/// Periodic eviction on the tokio runtime, stopped by a cancellation token.
pub struct EvictionDaemon {
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl EvictionDaemon {
    /// Start sweeping every `interval`; the first sweep runs immediately.
    pub fn start(evictor: Arc<Evictor>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let evictor = evictor.clone();
                match tokio::task::spawn_blocking(move || evictor.evict(Utc::now())).await {
                    Ok(Ok(report)) => debug!("Eviction sweep finished: {:?}", report),
                    Ok(Err(e)) => warn!("Eviction sweep failed: {}", e),
                    Err(e) => warn!("Eviction sweep panicked: {}", e),
                }
            }
            debug!("Eviction daemon stopped");
        });

        info!("Eviction daemon started (interval: {:?})", interval);
        Self {
            handle: Some(handle),
            cancel,
        }
    }

    /// Signal the daemon to stop after its current sweep.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for the daemon task to finish.
    pub async fn join(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Eviction daemon task failed: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for EvictionDaemon {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
