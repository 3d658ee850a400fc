use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for transient stats-write failures.
///
/// Delays grow as `base * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Backoff delay before the given zero-based retry attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
        }
    }
}

/// Tunables for the drill engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long the owner has to answer one question.
    pub question_time_limit: Duration,
    /// Inclusive bounds on the per-session question count.
    pub min_questions: u32,
    pub max_questions: u32,
    /// Substitution budget when a question cannot be rendered or sent.
    pub max_delivery_attempts: u32,
    /// Active sessions idle past this age get expired by the sweep.
    pub session_max_age: Duration,
    /// Upper bound on live token-to-response mappings.
    pub registry_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            question_time_limit: Duration::from_secs(60),
            min_questions: 1,
            max_questions: 50,
            max_delivery_attempts: 5,
            session_max_age: Duration::from_secs(60 * 60),
            registry_capacity: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Whether a requested question count is inside the allowed bounds.
    #[must_use]
    pub fn count_in_bounds(&self, count: u32) -> bool {
        (self.min_questions..=self.max_questions).contains(&count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn count_bounds() {
        let config = EngineConfig::default();
        assert!(!config.count_in_bounds(0));
        assert!(config.count_in_bounds(1));
        assert!(config.count_in_bounds(50));
        assert!(!config.count_in_bounds(51));
    }
}
