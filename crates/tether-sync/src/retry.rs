use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use tether_core::errors::SyncError;

/// Configuration for retry and backoff behavior on network operations.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

/// Runs fallible network operations with exponential backoff + jitter.
///
/// - Retries retryable errors up to `max_retries` times
/// - Respects `retry_after` hints from rate limit responses
/// - Fatal errors and conflicts are returned to the caller on first failure
/// - Cancellation drops the in-flight request; a request that was never
///   acknowledged never commits anything
pub struct Retry {
    config: RetryConfig,
    total_retries: AtomicU64,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Run `call` until it succeeds, fails permanently, or the retry budget
    /// is exhausted. `call` is invoked fresh for each attempt.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: &str,
        mut call: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        for attempt in 0..=self.config.max_retries {
            // Biased so an already-cancelled token wins before the call is
            // ever issued.
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                result = call() => result,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if e.is_fatal() || e.is_conflict() || attempt == self.config.max_retries {
                        return Err(e);
                    }

                    if !e.is_retryable() {
                        return Err(e);
                    }

                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);

                    warn!(
                        op,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after error"
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        Err(SyncError::NetworkError(format!("{op}: max retries exceeded")))
    }

    /// Calculate delay for a retry attempt using exponential backoff + jitter.
    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        // Respect server-suggested delay if provided
        if let Some(delay) = suggested {
            return delay;
        }

        // Exponential backoff: base * 2^attempt
        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);

        // Add jitter: delay * (1 ± jitter_factor)
        let jitter_range = capped * self.config.jitter_factor;
        let jitter = (random_u64() % (jitter_range as u64 * 2 + 1)) as f64 - jitter_range;
        let final_ms = (capped + jitter).max(100.0);

        Duration::from_millis(final_ms as u64)
    }
}

/// Simple non-cryptographic random u64 using thread-local state.
fn random_u64() -> u64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
        );
    }

    STATE.with(|s| {
        // xorshift64
        let mut x = s.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn success_on_first_try() {
        let retry = Retry::new(fast_config());
        let cancel = CancellationToken::new();

        let result = retry.run(&cancel, "op", || async { Ok::<_, SyncError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(retry.total_retries(), 0);
    }

    #[tokio::test]
    async fn retries_on_retryable_error() {
        let retry = Retry::new(fast_config());
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let result = retry
            .run(&cancel, "op", move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(SyncError::ServerError {
                            status: 500,
                            body: "internal".into(),
                        })
                    } else {
                        Ok("recovered")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retry.total_retries(), 2);
    }

    #[tokio::test]
    async fn fatal_error_not_retried() {
        let retry = Retry::new(fast_config());
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let result: Result<(), _> = retry
            .run(&cancel, "op", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::AuthenticationFailed("bad token".into())) }
            })
            .await;

        assert!(matches!(result, Err(SyncError::AuthenticationFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retry.total_retries(), 0);
    }

    #[tokio::test]
    async fn conflict_not_retried() {
        let retry = Retry::new(fast_config());
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let result: Result<(), _> = retry
            .run(&cancel, "op", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::ConflictBaseMismatch { expected_base: 850 }) }
            })
            .await;

        assert!(matches!(
            result,
            Err(SyncError::ConflictBaseMismatch { expected_base: 850 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retry.total_retries(), 0);
    }

    #[tokio::test]
    async fn max_retries_exhausted() {
        let retry = Retry::new(fast_config());
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let result: Result<(), _> = retry
            .run(&cancel, "op", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(SyncError::NetworkError("connection refused".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::NetworkError(_))));
        // 1 initial attempt + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(retry.total_retries(), 3);
    }

    #[tokio::test]
    async fn cancelled_before_response() {
        let retry = Retry::new(fast_config());
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        // The call never resolves, so only cancellation can end the run
        let result = retry
            .run(&cancel, "op", || std::future::pending::<Result<u64, SyncError>>())
            .await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn already_cancelled_never_invokes_call() {
        let retry = Retry::new(fast_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = retry
            .run(&cancel, "op", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_during_backoff() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
        };
        let retry = Retry::new(config);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let counter = calls.clone();
        let result: Result<(), _> = retry
            .run(&cancel, "op", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::NetworkTimeout("30s".into())) }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_delay_respects_suggested() {
        let retry = Retry::new(RetryConfig::default());
        let delay = retry.retry_delay(0, Some(Duration::from_secs(5)));
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[test]
    fn retry_delay_exponential_backoff() {
        let retry = Retry::new(RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
            ..Default::default()
        });

        assert_eq!(retry.retry_delay(0, None).as_millis(), 100);
        assert_eq!(retry.retry_delay(1, None).as_millis(), 200);
        assert_eq!(retry.retry_delay(2, None).as_millis(), 400);
    }

    #[test]
    fn retry_delay_capped_at_max() {
        let retry = Retry::new(RetryConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.0,
            ..Default::default()
        });

        // 1s * 2^10 = 1024s, capped at 5s
        assert_eq!(retry.retry_delay(10, None).as_millis(), 5000);
    }

    #[test]
    fn config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.jitter_factor - 0.2).abs() < f64::EPSILON);
    }
}
