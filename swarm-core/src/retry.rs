//! Exponential backoff for transient store I/O.
//!
//! Only errors reporting themselves recoverable are retried; everything
//! else surfaces immediately.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio::time::sleep;
use tracing::warn;

use crate::error::{Error, Result};

/// Backoff configuration for transient failures
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retry attempts after the first failure
    pub max_retries: u32,
    /// Initial delay before the first retry
    pub base_delay: Duration,
    /// Cap on the per-attempt delay
    pub max_delay: Duration,
    /// Fraction of the delay randomized to avoid thundering herds (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(2_u32.saturating_pow(attempt));
        let capped = exp.min(self.max_delay);
        if self.jitter_factor <= 0.0 {
            return capped;
        }
        let jitter_range = capped.as_millis() as f64 * self.jitter_factor;
        let jitter = rand::rng().random_range(0.0..=jitter_range.max(1.0));
        capped + Duration::from_millis(jitter as u64)
    }
}

/// Run `operation` with exponential backoff on recoverable errors.
///
/// The future factory is re-invoked for each attempt. Non-recoverable
/// errors are returned immediately without sleeping.
///
/// # Errors
///
/// Returns the last error once retries are exhausted.
pub async fn with_backoff<T, F, Fut>(config: &RetryConfig, op_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_recoverable() && attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                attempt += 1;
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying: {err}"
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let config = RetryConfig::new().with_base_delay(Duration::from_millis(1));

        let result = with_backoff(&config, "test", move || {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Storage("busy".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validation_errors_do_not_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let config = RetryConfig::default();

        let result: Result<()> = with_backoff(&config, "test", move || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Validation("malformed".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_last_error() {
        let config = RetryConfig::new()
            .with_max_retries(2)
            .with_base_delay(Duration::from_millis(1));

        let result: Result<()> =
            with_backoff(&config, "test", || async { Err(Error::Storage("down".to_string())) }).await;

        assert!(matches!(result, Err(Error::Storage(_))));
    }
}
