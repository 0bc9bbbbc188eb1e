// ABOUTME: Retry policy with capped exponential backoff and error-kind filtering
// ABOUTME: Decides which failures are re-attempted and how long to wait between attempts

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::error::{ErrorKind, TaskError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "default_retryable_error_kinds")]
    pub retryable_error_kinds: HashSet<ErrorKind>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_retryable_error_kinds() -> HashSet<ErrorKind> {
    [ErrorKind::Timeout, ErrorKind::Io, ErrorKind::Transient]
        .into_iter()
        .collect()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            exponential_base: default_exponential_base(),
            retryable_error_kinds: default_retryable_error_kinds(),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Create a retry policy with exponential backoff
    pub fn exponential_backoff(max_attempts: u32, initial_delay: Duration, base: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            exponential_base: base,
            ..Self::default()
        }
    }

    /// Create a retry policy with fixed delay
    pub fn fixed_delay(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: delay,
            max_delay: delay,
            exponential_base: 1.0,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_error_kinds = kinds.into_iter().collect();
        self
    }

    pub fn retry_on(mut self, kind: ErrorKind) -> Self {
        self.retryable_error_kinds.insert(kind);
        self
    }

    /// Delay before the retry that follows `attempt` (1-indexed).
    ///
    /// `min(initial_delay * base^(attempt-1), max_delay)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.exponential_base.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * factor;

        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::from_secs_f64(delay_secs.max(0.0))
    }

    pub fn is_retryable(&self, error: &TaskError) -> bool {
        self.retryable_error_kinds.contains(&error.kind)
    }

    /// Whether another attempt should follow a failed `attempt`.
    pub fn should_retry(&self, attempt: u32, error: &TaskError) -> bool {
        attempt < self.max_attempts && self.is_retryable(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_sequence_is_capped() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            exponential_base: 2.0,
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::default()
        };

        let delays: Vec<u64> = (1..=7).map(|a| policy.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10, 10]);
    }

    #[test]
    fn test_delay_is_non_decreasing() {
        let policy = RetryPolicy::exponential_backoff(10, Duration::from_millis(150), 1.7)
            .with_max_delay(Duration::from_secs(3));

        let mut previous = Duration::ZERO;
        for attempt in 1..50 {
            let delay = policy.delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(3));
            previous = delay;
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(u32::MAX), policy.max_delay);
    }

    #[test]
    fn test_delay_stays_capped_past_i32_range() {
        let policy = RetryPolicy::default();
        let edge = i32::MAX as u32;

        assert_eq!(policy.delay(edge), policy.max_delay);
        assert!(policy.delay(edge + 2) >= policy.delay(edge));
        assert_eq!(policy.delay(edge + 2), policy.max_delay);
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed_delay(4, Duration::from_millis(250));
        assert_eq!(policy.delay(1), Duration::from_millis(250));
        assert_eq!(policy.delay(3), Duration::from_millis(250));
    }

    #[test]
    fn test_should_retry_respects_kind_and_budget() {
        let policy = RetryPolicy::fixed_delay(3, Duration::ZERO);
        let transient = TaskError::transient("flaky");
        let fatal = TaskError::other("config", "bad input");

        assert!(policy.should_retry(1, &transient));
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));
        assert!(!policy.should_retry(1, &fatal));
    }

    #[test]
    fn test_deserialize_with_humantime() {
        let yaml = r#"
max_attempts: 5
initial_delay: 500ms
max_delay: 30s
retryable_error_kinds: [transient, timeout]
"#;
        let policy: RetryPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.exponential_base, 2.0);
        assert!(policy.retryable_error_kinds.contains(&ErrorKind::Transient));
        assert!(!policy.retryable_error_kinds.contains(&ErrorKind::Io));
    }
}
