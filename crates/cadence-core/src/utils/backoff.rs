//! Retry of fallible async operations with exponential backoff

use crate::config::BackoffConfig;
use crate::{Error, Result};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a failed operation should be retried
pub struct RetryPolicy<'a> {
    pub backoff: BackoffConfig,
    /// Number of retries after the first attempt, `0` means no retry
    pub total_retry: u32,
    /// Returns `false` for errors which should be propagated right away
    pub should_retry: &'a (dyn Fn(&Error) -> bool + Send + Sync),
    /// Called before waiting for each retry, with the retry count starting at 1
    pub on_retry: &'a mut (dyn FnMut(&Error, u32) + Send),
}

/// Run `run` until it succeeds, the policy gives up, or `cancel` fires.
///
/// Cancellation always resolves to [`Error::Cancelled`] and is never
/// retried, even if the operation itself failed at the same time.
pub async fn retry_with_backoff<T, F, Fut>(
    mut run: F,
    policy: RetryPolicy<'_>,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let RetryPolicy {
        backoff,
        total_retry,
        should_retry,
        on_retry,
    } = policy;
    let mut retry_count = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = run() => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if cancel.is_cancelled() || err.is_cancellation() {
            return Err(Error::Cancelled);
        }
        if !should_retry(&err) || retry_count >= total_retry {
            return Err(err);
        }

        retry_count += 1;
        on_retry(&err, retry_count);

        let delay = backoff.delay_for(retry_count);
        debug!(retry_count, delay_ms = delay.as_millis() as u64, "Retrying after backoff");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn backoff() -> BackoffConfig {
        BackoffConfig::new(Duration::from_millis(10), Duration::from_millis(40))
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let mut retries = Vec::new();
        let mut on_retry = |_: &Error, count: u32| retries.push(count);

        let result = retry_with_backoff(
            move || async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Timeout)
                } else {
                    Ok(42)
                }
            },
            RetryPolicy {
                backoff: backoff(),
                total_retry: 3,
                should_retry: &|_: &Error| true,
                on_retry: &mut on_retry,
            },
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_total_retry() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let mut on_retry = |_: &Error, _: u32| {};

        let result: Result<()> = retry_with_backoff(
            move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::Timeout)
            },
            RetryPolicy {
                backoff: backoff(),
                total_retry: 2,
                should_retry: &|_: &Error| true,
                on_retry: &mut on_retry,
            },
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_retry_stops_immediately() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let mut on_retry = |_: &Error, _: u32| {};

        let result: Result<()> = retry_with_backoff(
            move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::Internal("fatal".into()))
            },
            RetryPolicy {
                backoff: backoff(),
                total_retry: 5,
                should_retry: &|err: &Error| err.is_recoverable(),
                on_retry: &mut on_retry,
            },
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(Error::Internal(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_not_retried() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut on_retry = |_: &Error, _: u32| panic!("cancellation must not be retried");

        let result: Result<()> = retry_with_backoff(
            || async { Err(Error::Timeout) },
            RetryPolicy {
                backoff: backoff(),
                total_retry: 5,
                should_retry: &|_: &Error| true,
                on_retry: &mut on_retry,
            },
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
