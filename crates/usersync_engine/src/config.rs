//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Configuration for the operation queue and executors.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Debounce between an enqueue and the drain pass that picks it up.
    /// A flush skips it.
    pub execution_interval: Duration,
    /// How long a record the backend just created is left alone before
    /// follow-up calls address it.
    pub post_create_delay: Duration,
    /// How long after creation a 404 for a record is treated as replication
    /// lag and retried.
    pub missing_retry_window: Duration,
    /// Upper bound on one executor call. Elapsing counts as a retryable
    /// failure.
    pub backend_timeout: Duration,
}

impl SyncConfig {
    /// Creates a configuration with the default timings.
    pub fn new() -> Self {
        Self {
            retry: RetryConfig::default(),
            execution_interval: Duration::from_secs(5),
            post_create_delay: Duration::from_secs(5),
            missing_retry_window: Duration::from_secs(60),
            backend_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the enqueue debounce.
    pub fn with_execution_interval(mut self, interval: Duration) -> Self {
        self.execution_interval = interval;
        self
    }

    /// Sets the post-create delay.
    pub fn with_post_create_delay(mut self, delay: Duration) -> Self {
        self.post_create_delay = delay;
        self
    }

    /// Sets the missing-record retry window.
    pub fn with_missing_retry_window(mut self, window: Duration) -> Self {
        self.missing_retry_window = window;
        self
    }

    /// Sets the executor call timeout.
    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
///
/// Retryable failures are retried until they succeed or turn terminal;
/// there is no attempt cap.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given bounds.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that retries immediately.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% on top, never below the computed backoff.
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }

    /// Calculates the delay before retry number `attempt` when the backend
    /// asked to wait at least `retry_after`.
    pub fn delay_with_floor(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.delay_for_attempt(attempt);
        retry_after.map_or(backoff, |floor| floor.max(backoff))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}
