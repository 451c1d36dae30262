//! Bounded retry with fixed backoff

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// How many times to try and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// A single attempt, no retries
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Position of the current try within a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based
    pub number: u32,
    pub total: u32,
}

impl Attempt {
    pub fn is_last(&self) -> bool {
        self.number >= self.total
    }
}

/// Run `op` until it succeeds or the policy is exhausted
///
/// The error of the final attempt is returned.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, op: F) -> Result<T, E>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_if(policy, op, |_| true).await
}

/// Like [`retry`], but errors rejected by `should_retry` are returned immediately
pub async fn retry_if<T, E, F, Fut, P>(
    policy: RetryPolicy,
    mut op: F,
    mut should_retry: P,
) -> Result<T, E>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let total = policy.attempts.max(1);
    let mut number = 1;
    loop {
        let attempt = Attempt { number, total };
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt.is_last() || !should_retry(&err) => return Err(err),
            Err(_) => {
                debug!(attempt = number, total, backoff = ?policy.backoff, "Retrying");
                if !policy.backoff.is_zero() {
                    tokio::time::sleep(policy.backoff).await;
                }
                number += 1;
            }
        }
    }
}
