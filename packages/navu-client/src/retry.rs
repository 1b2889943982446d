//! Read-timeout retry with linear backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::{NavuError, Result};

/// How many attempts to make and how long to wait between them.
///
/// The wait before attempt `n + 1` is `backoff * n`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }
}

/// Run `op` until it succeeds, fails with something other than a read
/// timeout, or runs out of attempts.
///
/// `op` receives the 1-based attempt number. A timeout on the last attempt
/// is returned as [`NavuError::ReadTimeout`] carrying the attempt count.
pub async fn retry_on_timeout<T, F, Fut>(policy: &RetryPolicy, entity: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_read_timeout() => {
                tracing::warn!(
                    entity,
                    attempt,
                    attempts,
                    "Read timeout fetching entity"
                );
                if attempt >= attempts {
                    return Err(NavuError::ReadTimeout {
                        entity: entity.to_string(),
                        attempts,
                    });
                }
                tokio::time::sleep(policy.delay_after(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
