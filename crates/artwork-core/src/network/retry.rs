//! Retry logic with exponential backoff and jitter.
//!
//! Only the fetch pipeline retries. Each attempt is expected to re-acquire
//! the upstream rate limiter itself, so retries are paced like any other
//! request.

use crate::config::{ArtworkCacheConfig, NetworkConfig};
use crate::error::{ArtworkError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: NetworkConfig::MAX_RETRIES,
            base_delay: NetworkConfig::RETRY_BASE_DELAY,
            max_delay: NetworkConfig::RETRY_MAX_DELAY,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn from_config(config: &ArtworkCacheConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: config.retry_base_delay,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.exponential_base.powi(attempt as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            // Factor in [0.5, 1.5) keeps the mean and never collapses to zero
            let jitter_factor = rand::rng().random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }
}

/// Statistics about a retried operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub attempts: u32,
    /// Time spent sleeping between attempts.
    pub total_delay: Duration,
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// runs out of attempts. Retryability is [`ArtworkError::is_retryable`].
pub async fn retry_async<F, Fut, T>(config: &RetryConfig, mut operation: F) -> (Result<T>, RetryStats)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut stats = RetryStats::default();
    let mut attempt = 0;

    loop {
        stats.attempts = attempt + 1;

        let err: ArtworkError = match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("Fetch succeeded after {} attempts", attempt + 1);
                }
                return (Ok(value), stats);
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            debug!("Error is not retryable: {}", err);
            return (Err(err), stats);
        }

        if attempt + 1 >= config.max_attempts {
            warn!(
                "All {} fetch attempts exhausted. Last error: {}",
                config.max_attempts, err
            );
            return (Err(err), stats);
        }

        let delay = config.calculate_delay(attempt);
        stats.total_delay += delay;
        warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            attempt + 1,
            config.max_attempts,
            err,
            delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
