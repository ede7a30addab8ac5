use super::geotiff::GeoTiffError;
use anyhow::{Result, anyhow};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Delays between attempts: 2·base, 4·base, 8·base, ... with jitter, capped at
/// 30 s. Yields `retries` delays, so the total attempt count is `retries + 1`.
pub fn backoff(base: Duration, retries: usize) -> impl Iterator<Item = Duration> + Send {
    ExponentialBackoff::from_millis(2)
        .factor(base.as_millis() as u64)
        .max_delay(MAX_BACKOFF)
        .map(jitter)
        .take(retries)
}

/// Whether asking again may help. Client errors (4xx) and anything that
/// failed to parse or decode will fail the same way next time.
pub fn is_transient(error: &anyhow::Error) -> bool {
    if let Some(e) = error.downcast_ref::<reqwest::Error>() {
        return !(e.is_decode() || e.status().is_some_and(|status| status.is_client_error()));
    }
    !(error.is::<serde_json::Error>()
        || error.is::<GeoTiffError>()
        || error.is::<tiff::TiffError>())
}

/// Timeout and retry budget shared by one kind of remote call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, base_delay: Duration, timeout: Duration) -> Self {
        RetryPolicy {
            max_retries,
            base_delay,
            timeout,
        }
    }

    /// Calls `call` until it succeeds, fails permanently or the budget is
    /// spent. Every attempt is cut off after the policy timeout. Returns the
    /// last outcome and the number of attempts made.
    pub async fn run<T, F, Fut>(&self, what: &'static str, mut call: F) -> (Result<T>, usize)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = AtomicUsize::new(0);
        let attempts_ref = &attempts;
        let limit = self.timeout;

        let result = RetryIf::spawn(
            backoff(self.base_delay, self.max_retries),
            || {
                let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(attempt, "{} attempt", what);
                let pending = call();
                async move {
                    match timeout(limit, pending).await {
                        Ok(result) => result,
                        Err(_) => Err(anyhow!("{} timed out after {:?}", what, limit)),
                    }
                }
            },
            |e: &anyhow::Error| {
                let retry = is_transient(e);
                warn!(
                    attempt = attempts_ref.load(Ordering::SeqCst),
                    retry,
                    error = %e,
                    "{} failed",
                    what
                );
                retry
            },
        )
        .await;

        (result, attempts.load(Ordering::SeqCst))
    }
}
