//! Catalog-wide backfill of the artwork cache.
//!
//! The job walks the catalog in ascending album id order and drives
//! `ensure_all` for each album at background priority. Progress is
//! checkpointed after every album through the [`ProgressStore`](crate::metadata::ProgressStore),
//! so an interrupted run resumes where it stopped.

mod job;

pub use job::{MigrationJob, MigrationStatus};
