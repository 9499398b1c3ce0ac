//! The shared upstream rate limiter.
//!
//! One [`FetchLimiter`] is shared by every caller of the fetch pipeline, live
//! page requests and the backfill job alike, so the total outbound rate stays
//! under the configured ceiling. Permits are handed out through a FIFO gate;
//! background callers step aside whenever a live caller is queued.

use crate::error::{ArtworkError, Result};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::trace;

/// Who is asking for an upstream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Interactive resolution on behalf of a page request.
    Live,
    /// Backfill and other batch work.
    Background,
}

/// Permits granted so far, per priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub live_permits: u64,
    pub background_permits: u64,
    pub live_waiting: usize,
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct FetchLimiter {
    limiter: DirectLimiter,
    period: Duration,
    /// Serializes permit acquisition in arrival order.
    gate: Mutex<()>,
    live_waiting: AtomicUsize,
    live_released: Notify,
    live_permits: AtomicU64,
    background_permits: AtomicU64,
}

impl FetchLimiter {
    /// Limiter allowing `requests_per_second` with a burst of one.
    pub fn new(requests_per_second: f64) -> Result<Self> {
        if !(requests_per_second.is_finite() && requests_per_second > 0.0) {
            return Err(ArtworkError::Config {
                message: format!("invalid upstream rate: {}", requests_per_second),
            });
        }
        let period = Duration::from_secs_f64(1.0 / requests_per_second);
        let quota = Quota::with_period(period)
            .ok_or_else(|| ArtworkError::Config {
                message: format!("upstream rate too high: {}", requests_per_second),
            })?
            .allow_burst(NonZeroU32::MIN);

        Ok(Self {
            limiter: RateLimiter::direct(quota),
            period,
            gate: Mutex::new(()),
            live_waiting: AtomicUsize::new(0),
            live_released: Notify::new(),
            live_permits: AtomicU64::new(0),
            background_permits: AtomicU64::new(0),
        })
    }

    /// Minimum spacing between two upstream requests.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for an upstream permit. Never fails; callers simply wait.
    pub async fn acquire(&self, priority: Priority) {
        match priority {
            Priority::Live => self.acquire_live().await,
            Priority::Background => self.acquire_background().await,
        }
    }

    async fn acquire_live(&self) {
        self.live_waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = LiveWaiting(self);

        let _gate = self.gate.lock().await;
        self.limiter.until_ready().await;
        self.live_permits.fetch_add(1, Ordering::Relaxed);
        trace!("Live upstream permit granted");
    }

    async fn acquire_background(&self) {
        loop {
            // Registered before the check so a release in between is not missed
            let released = self.live_released.notified();
            if self.live_waiting.load(Ordering::SeqCst) == 0 {
                let _gate = self.gate.lock().await;
                if self.live_waiting.load(Ordering::SeqCst) == 0 {
                    self.limiter.until_ready().await;
                    self.background_permits.fetch_add(1, Ordering::Relaxed);
                    trace!("Background upstream permit granted");
                    return;
                }
            }
            released.await;
        }
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            live_permits: self.live_permits.load(Ordering::Relaxed),
            background_permits: self.background_permits.load(Ordering::Relaxed),
            live_waiting: self.live_waiting.load(Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for FetchLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchLimiter")
            .field("period", &self.period)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Decrements the live counter even if the waiting future is dropped.
struct LiveWaiting<'a>(&'a FetchLimiter);

impl Drop for LiveWaiting<'_> {
    fn drop(&mut self) {
        if self.0.live_waiting.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.live_released.notify_waiters();
        }
    }
}
