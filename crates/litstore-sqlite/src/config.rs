//! Backend configuration.
//!
//! Defaults match the timings the object store expects: 500 ms monitor
//! polling, 50 ms between write-lock attempts, and the default
//! [`RetryPolicy`]. [`BackendConfig::from_env`] reads overrides from:
//! - `LITSTORE_FAST`: `1`/`true` enables fast (non-durable) mode
//! - `LITSTORE_POLL_INTERVAL_MS`: monitor polling period in milliseconds

use std::sync::Arc;
use std::time::Duration;

use crate::retry::{Backoff, Clock, RetryPolicy, TokioClock};

/// Tunables for a [`SqliteBackend`](crate::SqliteBackend).
#[derive(Clone)]
pub struct BackendConfig {
    /// Trades durability for throughput: `synchronous=OFF` and
    /// `read_uncommitted=1`. Transactions stay atomic.
    pub fast: bool,
    /// Retry schedule for busy/locked engine calls.
    pub retry: RetryPolicy,
    /// Period of the shared-file change monitor.
    pub poll_interval: Duration,
    /// Wait between attempts to take the in-process write lock.
    pub write_lock_retry_delay: Duration,
    /// Clock used for every retry delay.
    pub clock: Arc<dyn Clock>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            fast: false,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(500),
            write_lock_retry_delay: Duration::from_millis(50),
            clock: Arc::new(TokioClock),
        }
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("fast", &self.fast)
            .field("retry", &self.retry)
            .field("poll_interval", &self.poll_interval)
            .field("write_lock_retry_delay", &self.write_lock_retry_delay)
            .finish_non_exhaustive()
    }
}

impl BackendConfig {
    /// Defaults overridden by `LITSTORE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = BackendConfig::default();

        if let Ok(fast) = std::env::var("LITSTORE_FAST") {
            config.fast = matches!(fast.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Ok(ms) = std::env::var("LITSTORE_POLL_INTERVAL_MS") {
            match ms.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.poll_interval = Duration::from_millis(ms),
                _ => tracing::warn!(value = %ms, "ignoring invalid LITSTORE_POLL_INTERVAL_MS"),
            }
        }

        config
    }

    pub fn fast(mut self, fast: bool) -> Self {
        self.fast = fast;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub(crate) fn backoff(&self) -> Backoff {
        Backoff::new(self.retry.clone(), Arc::clone(&self.clock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_monitor_and_lock_timings() {
        let config = BackendConfig::default();
        assert!(!config.fast);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.write_lock_retry_delay, Duration::from_millis(50));
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn builders_override_fields() {
        let config = BackendConfig::default()
            .fast(true)
            .with_poll_interval(Duration::from_millis(20))
            .with_retry(RetryPolicy::fixed(Duration::from_millis(5)));
        assert!(config.fast);
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.retry.max_delay, Duration::from_millis(5));
    }
}
