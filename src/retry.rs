//! Retry with exponential backoff and jitter.
//!
//! Used for setup calls that may fail transiently while a fresh kind cluster
//! settles (client creation, discovery, applying CRDs). Admission probes are
//! never retried: a retried create can turn a denial into a conflict.
//!
//! # Example
//!
//! ```ignore
//! use vap_library::retry::{retry_with_backoff, RetryConfig};
//!
//! let client = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(10),
//!     "create_kube_client",
//!     || async { create_client_once(path).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff parameters for a retried operation.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = retry forever)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Factor applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default backoff with a specific attempt budget
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Next delay after `current`, capped at `max_delay`
    fn next_delay(&self, current: Duration) -> Duration {
        let grown = current.as_secs_f64() * self.backoff_multiplier;
        Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()))
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Run `operation` until it succeeds or the attempt budget is spent.
///
/// Each failure sleeps for the current delay scaled by a random factor in
/// `0.5..1.5`, then grows the delay by `backoff_multiplier`. Returns the last
/// error once `max_attempts` is reached.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if config.exhausted(attempt) {
            error!(
                operation = %operation_name,
                attempt,
                error = %err,
                "giving up after max attempts"
            );
            return Err(err);
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let sleep_for = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = sleep_for.as_millis() as u64,
            "operation failed, retrying"
        );
        tokio::time::sleep(sleep_for).await;
        delay = config.next_delay(delay);
    }
}
