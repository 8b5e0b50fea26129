//! Retry strategy with exponential backoff for transient errors.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use pcemirror_common::{Backoff, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Delay schedule between attempts.
    pub backoff: Backoff,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::default().with_max_delay(Duration::from_secs(30)),
            jitter: true,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.backoff = self.backoff.with_initial_delay(delay);
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.backoff = self.backoff.with_max_delay(delay);
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.backoff.delay_for_attempt(attempt);

        if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            delay.mul_f64(jitter_factor)
        } else {
            delay
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Runs idempotent remote reads under a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `request` until it succeeds, fails permanently or the retry
    /// budget is spent. Only errors for which
    /// [`is_transient`](pcemirror_common::Error::is_transient) holds are
    /// retried. `label` names the request in log lines.
    pub async fn execute<F, Fut, T>(&self, label: &str, request: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0u32;

        loop {
            let err = match request().await {
                Ok(value) => {
                    if retries > 0 {
                        debug!("{} succeeded on retry {}", label, retries);
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && retries < self.config.max_retries => err,
                Err(err) => {
                    if retries > 0 {
                        warn!("{} gave up after {} retries: {}", label, retries, err);
                    }
                    return Err(err);
                }
            };

            let delay = self.config.delay_for_attempt(retries);
            retries += 1;
            warn!("{} failed ({}), retry {} in {:?}", label, err, retries, delay);
            sleep(delay).await;
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcemirror_common::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::new(max_retries)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig::new(3).with_initial_delay(Duration::from_millis(1000));

        for _ in 0..50 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_schedule_without_jitter_is_capped() {
        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(3))
            .with_jitter(false);

        let delays: Vec<_> = (0..4).map(|a| config.delay_for_attempt(a)).collect();
        assert_eq!(
            delays,
            [1, 2, 3, 3].map(Duration::from_secs).to_vec()
        );
    }

    #[tokio::test]
    async fn test_recovers_from_bad_gateway() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let value = quick(3)
            .execute("GET labels", || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(Error::remote(Some(502), "bad gateway")),
                    _ => Ok("page"),
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "page");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_forbidden_is_final() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let err = quick(3)
            .execute("GET workloads", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::remote(Some(403), "forbidden"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Remote { status: Some(403), .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = quick(2)
            .execute("GET job", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::remote(None, "connection reset"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
