use std::future::Future;

use storage::repository::StorageError;
use tracing::warn;

use crate::config::RetryPolicy;

/// Whether an error is worth retrying. Lookup misses and mapping bugs are
/// permanent; contention and connectivity are not.
fn is_transient(error: &StorageError) -> bool {
    matches!(error, StorageError::Conflict | StorageError::Connection(_))
}

/// Runs storage operations under the configured backoff policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs `op`, retrying transient failures with exponential backoff.
    /// After the initial attempt, up to `max_attempts` retries are made.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, or immediately for
    /// permanent errors.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if is_transient(&error) && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(%error, label, attempt, ?delay, "transient storage failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
