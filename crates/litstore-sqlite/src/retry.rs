//! Busy/locked retry policy with an injectable clock.
//!
//! SQLite reports contention as `SQLITE_BUSY` or `SQLITE_LOCKED`. The
//! backend disables rusqlite's internal busy handler and retries here
//! instead, so the delay schedule is explicit and testable:
//!
//! - delays grow from [`RetryPolicy::initial_delay`] by
//!   [`RetryPolicy::multiplier`] up to [`RetryPolicy::max_delay`];
//! - attempts are unbounded unless [`RetryPolicy::max_attempts`] is set;
//! - a warning is logged each time the accumulated wait crosses another
//!   [`RetryPolicy::warn_interval`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::StorageError;

/// Boxed future returned by [`Clock::sleep`].
pub type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Source of retry delays.
pub trait Clock: Send + Sync + 'static {
    fn sleep(&self, duration: Duration) -> SleepFuture;
}

/// Production clock backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn sleep(&self, duration: Duration) -> SleepFuture {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Delay schedule for contended engine calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    /// `None` retries until the contention clears.
    pub max_attempts: Option<u32>,
    /// Accumulated wait between warnings. Zero disables them.
    pub warn_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_delay: Duration::from_millis(25),
            multiplier: 2,
            max_delay: Duration::from_millis(200),
            max_attempts: None,
            warn_interval: Duration::from_millis(2500),
        }
    }
}

impl RetryPolicy {
    /// A constant-delay policy.
    pub fn fixed(delay: Duration) -> Self {
        RetryPolicy {
            initial_delay: delay,
            multiplier: 1,
            max_delay: delay,
            ..RetryPolicy::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay to wait after the `attempt`-th consecutive failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = delay.saturating_mul(self.multiplier.max(1));
            if delay >= self.max_delay {
                return self.max_delay;
            }
        }
        delay.min(self.max_delay)
    }

    /// Total time slept over the first `attempts` failures.
    pub fn total_delay(&self, attempts: u32) -> Duration {
        let mut total = Duration::ZERO;
        for attempt in 1..=attempts {
            let delay = self.delay_for(attempt);
            if delay >= self.max_delay {
                return total + self.max_delay * (attempts - attempt + 1);
            }
            total += delay;
        }
        total
    }
}

/// True when going from `before` to `after` passes a multiple of `interval`.
pub(crate) fn crosses_interval(interval: Duration, before: Duration, after: Duration) -> bool {
    if interval.is_zero() {
        return false;
    }
    after.as_nanos() / interval.as_nanos() > before.as_nanos() / interval.as_nanos()
}

/// A [`RetryPolicy`] bound to a [`Clock`].
#[derive(Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff").field("policy", &self.policy).finish()
    }
}

impl Backoff {
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Backoff { policy, clock }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Waits after the `attempt`-th contended try of `operation`, or gives up
    /// if the policy is bounded and exhausted.
    pub async fn wait(
        &self,
        operation: &'static str,
        attempt: u32,
        database: &str,
    ) -> Result<(), StorageError> {
        if let Some(max) = self.policy.max_attempts {
            if attempt >= max {
                return Err(StorageError::RetriesExhausted {
                    operation,
                    attempts: attempt,
                    database: database.to_string(),
                });
            }
        }

        let waited = self.policy.total_delay(attempt.saturating_sub(1));
        let delay = self.policy.delay_for(attempt);
        if crosses_interval(self.policy.warn_interval, waited, waited + delay) {
            tracing::warn!(
                operation,
                attempt,
                database,
                waited_ms = (waited + delay).as_millis() as u64,
                "SQLite database still busy, continuing to wait"
            );
        }

        self.clock.sleep(delay).await;
        Ok(())
    }

    /// Runs `f` until it returns something other than a transient error.
    pub async fn retry<T, F, Fut>(
        &self,
        operation: &'static str,
        database: &str,
        mut f: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0u32;
        loop {
            match f().await {
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    self.wait(operation, attempt, database).await?;
                }
                other => return other,
            }
        }
    }

    /// Runs a synchronous engine call against a shared connection, retrying
    /// on contention. The connection guard is released before each wait.
    pub async fn with_connection<T, F>(
        &self,
        conn: &Mutex<Connection>,
        operation: &'static str,
        database: &str,
        f: F,
    ) -> Result<T, StorageError>
    where
        F: Fn(&Connection) -> Result<T, StorageError> + Sync,
    {
        let f = &f;
        self.retry(operation, database, move || async move {
            let guard = conn.lock().await;
            f(&guard)
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rusqlite::ffi;
    use std::sync::Mutex as StdMutex;

    /// Clock that records requested delays and returns immediately.
    #[derive(Default)]
    pub(crate) struct RecordingClock {
        pub(crate) sleeps: StdMutex<Vec<Duration>>,
    }

    impl Clock for RecordingClock {
        fn sleep(&self, duration: Duration) -> SleepFuture {
            self.sleeps.lock().unwrap().push(duration);
            Box::pin(async {})
        }
    }

    pub(crate) fn busy() -> StorageError {
        StorageError::Sqlite(rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_BUSY),
            None,
        ))
    }

    #[test]
    fn default_policy_doubles_up_to_the_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=6)
            .map(|n| policy.delay_for(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![25, 50, 100, 200, 200, 200]);
    }

    #[test]
    fn fixed_policy_never_grows() {
        let policy = RetryPolicy::fixed(Duration::from_millis(25));
        assert_eq!(policy.delay_for(1), Duration::from_millis(25));
        assert_eq!(policy.delay_for(500), Duration::from_millis(25));
    }

    #[test]
    fn warnings_follow_accumulated_wait() {
        let fixed = RetryPolicy::fixed(Duration::from_millis(25));
        let warn_at: Vec<u32> = (1..=300)
            .filter(|&n| {
                let before = fixed.total_delay(n - 1);
                crosses_interval(fixed.warn_interval, before, before + fixed.delay_for(n))
            })
            .collect();
        assert_eq!(warn_at, vec![100, 200, 300]);

        let backoff = RetryPolicy::default();
        assert_eq!(backoff.total_delay(4), Duration::from_millis(375));
        assert_eq!(backoff.total_delay(6), Duration::from_millis(775));
        let first_warning = (1..)
            .find(|&n| {
                let before = backoff.total_delay(n - 1);
                crosses_interval(backoff.warn_interval, before, before + backoff.delay_for(n))
            })
            .unwrap();
        assert_eq!(first_warning, 15);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_with_backoff() {
        let clock = Arc::new(RecordingClock::default());
        let backoff = Backoff::new(RetryPolicy::default(), clock.clone());

        let mut calls = 0;
        let result = backoff
            .retry("test", "db", || {
                calls += 1;
                let outcome = if calls < 3 { Err(busy()) } else { Ok(calls) };
                async move { outcome }
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(
            *clock.sleeps.lock().unwrap(),
            vec![Duration::from_millis(25), Duration::from_millis(50)]
        );
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let clock = Arc::new(RecordingClock::default());
        let backoff = Backoff::new(RetryPolicy::default(), clock.clone());

        let mut calls = 0;
        let err = backoff
            .retry("test", "db", || {
                calls += 1;
                async { Err::<(), _>(StorageError::InvalidCursor("nope".into())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::InvalidCursor(_)));
        assert_eq!(calls, 1);
        assert!(clock.sleeps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bounded_policy_gives_up() {
        let clock = Arc::new(RecordingClock::default());
        let backoff = Backoff::new(RetryPolicy::default().with_max_attempts(3), clock.clone());

        let err = backoff
            .retry("load", "db", || async { Err::<(), _>(busy()) })
            .await
            .unwrap_err();

        match err {
            StorageError::RetriesExhausted {
                operation, attempts, ..
            } => {
                assert_eq!(operation, "load");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(clock.sleeps.lock().unwrap().len(), 2);
    }
}
