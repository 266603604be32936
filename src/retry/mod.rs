mod policy;

pub use policy::RetryPolicy;

use std::future::Future;

use tracing::debug;

use crate::error::{ChatError, Result};

/// Metadata for one failed attempt.
#[derive(Debug)]
pub struct RetryAttempt<'a> {
    pub attempt: u32,
    pub max_attempts: u32,
    pub error: &'a ChatError,
}

impl RetryPolicy {
    /// Run `operation` until it succeeds or the attempt budget is spent.
    ///
    /// - `operation(attempt)` is called with a 1-based attempt number.
    /// - Failed attempts are retried immediately.
    /// - After the last failure the policy sleeps `final_delay` once and
    ///   returns [`ChatError::RetryExhausted`] wrapping the last error.
    pub async fn run<T, Op, Fut>(&self, label: &str, operation: Op) -> Result<T>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_with(operation, |info| {
            debug!(
                operation = label,
                attempt = info.attempt,
                max_attempts = info.max_attempts,
                error = %info.error,
                "attempt failed"
            );
        })
        .await
    }

    /// Like [`run`](Self::run), calling `on_failure` after every failed attempt.
    pub async fn run_with<T, Op, Fut, OnFailure>(
        &self,
        mut operation: Op,
        mut on_failure: OnFailure,
    ) -> Result<T>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        OnFailure: FnMut(RetryAttempt<'_>),
    {
        let max_attempts = self.effective_attempts();
        let mut last = None;

        for attempt in 1..=max_attempts {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    on_failure(RetryAttempt {
                        attempt,
                        max_attempts,
                        error: &err,
                    });
                    last = Some(err);
                }
            }
        }

        if !self.final_delay.is_zero() {
            tokio::time::sleep(self.final_delay).await;
        }

        Err(ChatError::RetryExhausted {
            attempts: max_attempts,
            last: Box::new(last.unwrap_or(ChatError::ConnectionClosed)),
        })
    }
}
