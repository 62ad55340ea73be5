//! Requests over several CDNs with exponential backoff

use crate::config::SegmentBackoffOptions;
use crate::error::{Error, Result};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Whether a failed segment request is worth trying again
pub fn should_retry(err: &Error) -> bool {
    match err {
        Error::Network { .. } | Error::Timeout => true,
        Error::Http { status, .. } => *status >= 500 || matches!(*status, 404 | 412 | 415),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    None,
    Regular,
    Offline,
}

fn failure_kind(err: &Error, is_offline: bool) -> FailureKind {
    if is_offline && matches!(err, Error::Network { .. }) {
        FailureKind::Offline
    } else {
        FailureKind::Regular
    }
}

/// Request the first URL, moving to the next one on failure.
///
/// Once every URL failed with a retryable error, waits for the backoff
/// delay and starts over from the first one. The retry counter restarts
/// each time failures switch between regular and offline ones. URLs failing
/// with a non-retryable error are not tried again. `on_retry` is called
/// before every new attempt.
pub async fn try_urls_with_backoff<T, F, Fut>(
    urls: &[Url],
    mut request: F,
    options: &SegmentBackoffOptions,
    is_offline: &(dyn Fn() -> bool + Send + Sync),
    mut on_retry: impl FnMut(&Error),
    cancel: &CancellationToken,
) -> Result<T>
where
    F: FnMut(&Url) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut urls: Vec<Url> = urls.to_vec();
    if urls.is_empty() {
        return Err(Error::PipelineLoad("no URL to request".into()));
    }

    let mut index = 0;
    let mut retry_count = 0u32;
    let mut last_failure = FailureKind::None;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = request(&urls[index]) => result,
        };
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => err,
        };

        if !should_retry(&err) {
            if urls.len() <= 1 {
                return Err(err);
            }
            warn!(url = %urls[index], error = %err, "Fetchers: Removing failing URL");
            urls.remove(index);
            if index >= urls.len() {
                index = 0;
            }
            on_retry(&err);
            continue;
        }

        let failure = failure_kind(&err, is_offline());
        let max_retry = match failure {
            FailureKind::Offline => options.max_retry_offline,
            _ => options.max_retry_regular,
        };
        if failure != last_failure {
            retry_count = 0;
            last_failure = failure;
        }

        if index + 1 < urls.len() {
            debug!(url = %urls[index], error = %err, "Fetchers: Trying next URL");
            index += 1;
            on_retry(&err);
            continue;
        }

        retry_count += 1;
        if retry_count > max_retry {
            return Err(err);
        }
        let delay = options.backoff.delay_for(retry_count);
        warn!(
            retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Fetchers: Request failed, retrying after backoff"
        );
        on_retry(&err);
        index = 0;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
