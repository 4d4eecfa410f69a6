//! Fixed-increment polling bounded by a maximum total wait.
//!
//! Used where another party is expected to make a resource appear (for
//! example a key being created under a lease held by a different process).
//! Unlike exponential retry, every attempt is spaced by the same interval
//! and the loop fails definitively once the total wait is exhausted.

use crate::PlatformError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Polling configuration.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between two attempts
    pub interval: Duration,
    /// Maximum total time spent polling
    pub max_wait: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(60),
        }
    }
}

impl PollConfig {
    /// Set the interval between attempts.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the maximum total wait.
    #[must_use]
    pub const fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

/// Polls an operation until it yields a value, fails, or time runs out.
#[derive(Debug, Clone, Default)]
pub struct PollPolicy {
    config: PollConfig,
}

impl PollPolicy {
    /// Create a new policy.
    #[must_use]
    pub const fn new(config: PollConfig) -> Self {
        Self { config }
    }

    /// Upper bound on the number of attempts this policy makes.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        if self.config.interval.is_zero() {
            return 1;
        }
        let slots = self.config.max_wait.as_millis() / self.config.interval.as_millis().max(1);
        u32::try_from(slots).unwrap_or(u32::MAX).saturating_add(1)
    }

    /// Run `operation` until it returns `Ok(Some(_))`.
    ///
    /// `Ok(None)` means "not there yet"; any `Err` ends polling immediately.
    ///
    /// # Errors
    ///
    /// Returns the operation's error, or [`PlatformError::PollTimeout`]
    /// (converted into `E`) when `max_wait` elapses first.
    pub async fn poll_until<F, Fut, T, E>(&self, what: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: From<PlatformError>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if let Some(value) = operation().await? {
                return Ok(value);
            }

            let waited = started.elapsed();
            if waited + self.config.interval > self.config.max_wait {
                return Err(PlatformError::poll_timeout(what, waited).into());
            }
            debug!(what, attempt, interval_ms = self.config.interval.as_millis() as u64, "not ready, polling again");
            tokio::time::sleep(self.config.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> PollPolicy {
        PollPolicy::new(
            PollConfig::default()
                .with_interval(Duration::from_millis(10))
                .with_max_wait(Duration::from_millis(55)),
        )
    }

    #[test]
    fn test_max_attempts() {
        assert_eq!(fast_policy().max_attempts(), 6);
        assert_eq!(PollPolicy::default().max_attempts(), 31);
    }

    #[tokio::test]
    async fn test_poll_returns_value_once_ready() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<&str, PlatformError> = fast_policy()
            .poll_until("key", move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    Ok(if n >= 2 { Some("ready") } else { None })
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ready");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_stops_on_error() {
        let result: Result<(), PlatformError> = fast_policy()
            .poll_until("key", || async { Err(PlatformError::invalid_input("nope")) })
            .await;
        assert!(matches!(result, Err(PlatformError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), PlatformError> = fast_policy()
            .poll_until("key", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(None) }
            })
            .await;

        assert!(matches!(result, Err(PlatformError::PollTimeout { .. })));
        let attempts = calls.load(Ordering::SeqCst);
        assert!(attempts >= 2 && attempts <= fast_policy().max_attempts());
    }
}
