//! Retry-until-majority-commit for coordinator document writes
//!
//! Retries the write, never the action that follows it. Transient errors
//! (`Error::is_retryable`) back off with jitter until the write commits or
//! the run is cancelled; anything else is returned to the caller.

use crate::common::{Error, Result, RetryPolicy};
use crate::coordinator::cancel::{CancelCause, CancelScope, CancelState};
use std::future::Future;
use std::time::Duration;

pub struct RetryUntilMajorityCommit {
    policy: RetryPolicy,
    cancel: CancelState,
}

impl RetryUntilMajorityCommit {
    pub fn new(policy: RetryPolicy, cancel: CancelState) -> Self {
        Self { policy, cancel }
    }

    /// Run `write` until it succeeds, fails permanently, or `scope` is cancelled.
    pub async fn run<F, Fut>(&self, scope: CancelScope, what: &str, mut write: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut backoff = self.policy.initial_backoff;
        let mut attempt: u32 = 0;

        loop {
            if let cause @ (CancelCause::Stepdown | CancelCause::Abort(_)) =
                self.cancel.cause_in(scope)
            {
                return Err(Error::Cancelled(cause.to_string()));
            }

            attempt += 1;
            match write().await {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "{} committed after retries", what);
                    }
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(attempt, error = %e, "{} not majority committed, retrying", what);
                }
                Err(e) => return Err(e),
            }

            let delay = jittered(backoff);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                cause = self.cancel.cancelled(scope) => {
                    return Err(Error::Cancelled(cause.to_string()));
                }
            }
            backoff = (backoff * 2).min(self.policy.max_backoff);
        }
    }
}

fn jittered(backoff: Duration) -> Duration {
    let millis = backoff.as_millis() as u64;
    if millis == 0 {
        return backoff;
    }
    Duration::from_millis(millis / 2 + rand::random::<u64>() % (millis / 2 + 1))
}
