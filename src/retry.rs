//! Bounded retry with exponential backoff.
//!
//! Every outbound call the reconciler makes goes through [`with_retry`]
//! with an operation-specific [`RetryPolicy`]. Exhausting a policy
//! surfaces the final error unchanged; what that means (abort the cycle,
//! skip the item, leave the record for the next pass) is decided at the
//! call site.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tracing::warn;

/// Per-operation retry parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between retries.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Recorder API calls: three attempts, a flat ten seconds apart.
    pub const fn recorder() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Uploads: three attempts, backing off from four seconds up to ten.
    pub const fn upload() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(10),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_delay,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted,
/// sleeping between attempts.
pub async fn with_retry<T, E, F, Fut>(policy: RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = policy.backoff();
    let mut attempt = 1u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts => {
                let delay = backoff.next_backoff().unwrap_or(policy.max_delay);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
