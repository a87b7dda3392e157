//! Fixed-delay retry for fallible async operations
//!
//! The helper knows nothing about which failures are worth retrying; callers
//! only wrap operations that are. Cancellation is the usual tokio kind: when
//! the enclosing future is dropped or its task aborted, the in-flight attempt
//! or inter-attempt sleep is abandoned and no further attempts are made.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How many times to try, and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one (0 behaves like 1)
    pub attempts: u32,
    /// Pause between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

/// Run `operation` until it succeeds or the policy's attempts are used up.
///
/// The closure receives the 1-based attempt number. The error of the last
/// attempt is returned unchanged.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    retry_if(policy, |_| true, operation).await
}

/// Like [`retry`], but an error for which `retryable` returns false is
/// returned at once without using up the remaining attempts.
pub async fn retry_if<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !retryable(&e) => {
                debug!("[RETRY] Attempt {} failed, not retrying: {}", attempt, e);
                return Err(e);
            }
            Err(e) if attempt >= attempts => {
                warn!("[RETRY] Giving up after {} attempt(s): {}", attempt, e);
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "[RETRY] Attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt, attempts, e, policy.delay
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}
