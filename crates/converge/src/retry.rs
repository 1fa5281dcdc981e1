//! Retry with exponential backoff and jitter, bounded by attempts and a deadline.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, warn};

#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = until the deadline)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self { max_attempts: attempts, ..Default::default() }
    }
}

/// Run `operation` until it succeeds, fails with an error `retryable` rejects, runs out of
/// attempts, or the next backoff would overshoot `deadline`. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    deadline: Option<Instant>,
    operation_name: &str,
    retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        if !retryable(&e) {
            debug!(operation = %operation_name, attempt, error = %e, "permanent failure");
            return Err(e);
        }
        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(operation = %operation_name, attempt, error = %e, "operation failed after max retries");
            return Err(e);
        }

        // 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        if let Some(deadline) = deadline {
            if Instant::now() + jittered > deadline {
                error!(operation = %operation_name, attempt, error = %e, "operation deadline exceeded");
                return Err(e);
            }
        }
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = jittered.as_millis() as u64,
            "operation failed, retrying"
        );
        tokio::time::sleep(jittered).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn succeeds_after_retryable_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<u32, String> = retry_with_backoff(&fast(5), None, "op", |_| true, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("conflict {}", n))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<(), &str> = retry_with_backoff(&fast(5), None, "op", |e| *e != "forbidden", || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err("forbidden") }
        })
        .await;
        assert_eq!(result, Err("forbidden"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<(), &str> = retry_with_backoff(&fast(3), None, "op", |_| true, || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err("conflict") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deadline_bounds_unlimited_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let deadline = Instant::now() + Duration::from_millis(30);
        let result: Result<(), &str> = retry_with_backoff(&fast(0), Some(deadline), "op", |_| true, || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err("conflict") }
        })
        .await;
        assert!(result.is_err());
        assert!(Instant::now() <= deadline + Duration::from_millis(10));
        assert!(count.load(Ordering::SeqCst) >= 2);
    }
}
