/// Retry helpers for background tasks
///
/// Exponential backoff shared by the market data pumps (reconnects) and the
/// payment reconciler (ledger reads).

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Number of retries after the initial attempt
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }
}

/// Run `op` until it succeeds, a non-retryable error comes back, or the retry
/// budget is spent. The last error is returned.
///
/// # Arguments
/// * `task_name` - Used in log lines
/// * `policy` - Backoff schedule
/// * `is_retryable` - Classifies errors; `false` returns immediately
/// * `op` - Produces one attempt
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    task_name: &str,
    policy: &BackoffPolicy,
    is_retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries && is_retryable(&e) => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed (retry {}/{} in {:?}): {}",
                    task_name, attempt, policy.max_retries, delay, e
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(1000), max_retries)
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = policy(10);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
        assert_eq!(p.delay_for(5), Duration::from_millis(1000));
        assert_eq!(p.delay_for(40), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<u32, String> = retry_with_backoff("flaky", &policy(3), |_| true, || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("timeout".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), String> = retry_with_backoff("down", &policy(2), |_| true, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err("unreachable".to_string()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), String> =
            retry_with_backoff("bad input", &policy(5), |e: &String| e != "invalid", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err("invalid".to_string()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
