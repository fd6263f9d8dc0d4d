//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for activity retries
///
/// Supports exponential backoff with a cap and jitter to avoid thundering
/// herd. The whole invocation remains bounded by the activity's
/// start-to-close timeout.
///
/// # Example
///
/// ```
/// use windlass_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60));
///
/// // First retry after ~1 second, then ~2, ~4, ...
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Initial delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,

    /// Error types that should NOT be retried
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy with sensible defaults
    ///
    /// - 5 max attempts
    /// - 1 second initial interval
    /// - 60 second max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Add a non-retryable error type
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Calculate delay for a given attempt number (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1; // First retry is after attempt 1
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Check if an error type should be retried
    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        if let Some(error_type) = error_type {
            !self.non_retryable_errors.contains(&error_type.to_string())
        } else {
            true
        }
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
