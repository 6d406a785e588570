//! Retry utility with exponential backoff

use std::time::Duration;
use tracing::warn;

const MAX_DELAY: Duration = Duration::from_secs(30);

/// Retry an async operation with exponential backoff.
///
/// Returns `Ok` on first success, or the last `Err` after all attempts are exhausted.
/// Delays: `initial_delay`, `2 * initial_delay`, `4 * initial_delay`, ... capped at 30s.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation_name: &str,
    max_attempts: u32,
    initial_delay: Duration,
    f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(operation_name, max_attempts, initial_delay, f, |_| true).await
}

/// Like [`retry_with_backoff`], but gives up immediately on errors for which
/// `should_retry` returns false.
///
/// At least one attempt is always made, even with `max_attempts == 0`.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    operation_name: &str,
    max_attempts: u32,
    initial_delay: Duration,
    mut f: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut delay = initial_delay;
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if attempt >= max_attempts || !should_retry(&e) => return Err(e),
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, max_attempts, e
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let result: Result<&str, String> =
            retry_with_backoff("test", 3, Duration::from_millis(1), || async { Ok("done") }).await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_succeeds_after_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let result: Result<&str, String> =
            retry_with_backoff("test", 3, Duration::from_millis(1), move || {
                let counter = counter_clone.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::Relaxed);
                    if n < 2 {
                        Err(format!("fail #{}", n))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_all_attempts_fail() {
        let result: Result<(), String> =
            retry_with_backoff("test", 2, Duration::from_millis(1), || async {
                Err("always fails".to_string())
            })
            .await;
        assert_eq!(result.unwrap_err(), "always fails");
    }

    #[tokio::test]
    async fn test_stops_on_permanent_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let result: Result<(), String> = retry_with_backoff_if(
            "test",
            5,
            Duration::from_millis(1),
            move || {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err("invalid target".to_string())
                }
            },
            |e| !e.starts_with("invalid"),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_runs_once() {
        let result: Result<u32, String> =
            retry_with_backoff("test", 0, Duration::from_millis(1), || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
