//! Bounded retry with a fixed delay between attempts.

use std::future::Future;

use sparrow_commons::RetryConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last error.
    #[error("all attempts failed: {0}")]
    Exhausted(E),
    /// The context was cancelled between attempts.
    #[error("cancelled while retrying")]
    Cancelled,
}

/// Run `attempt` up to `config.count + 1` times, sleeping `config.delay`
/// between attempts. The first success wins. Cancellation is observed
/// between attempts, never mid-attempt; the in-flight attempt's own timeout
/// bounds it instead.
pub async fn retry<T, E, F, Fut>(
    ctx: &CancellationToken, config: RetryConfig, mut attempt: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err = None;

    for run in 0..=config.count {
        if run > 0 && !config.delay.is_zero() {
            tokio::select! {
                _ = ctx.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(config.delay) => {}
            }
        }
        if ctx.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => last_err = Some(e),
        }
    }

    match last_err {
        Some(e) => Err(RetryError::Exhausted(e)),
        // count + 1 >= 1 attempts always run unless cancelled first.
        None => Err(RetryError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{
        AtomicU32,
        Ordering,
    };
    use std::time::Duration;

    use super::*;

    fn config(count: u32, delay: Duration) -> RetryConfig {
        RetryConfig { count, delay }
    }

    #[tokio::test]
    async fn test_zero_count_is_single_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<&str>> =
            retry(&CancellationToken::new(), config(0, Duration::ZERO), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom") }
            })
            .await;
        assert_eq!(result, Err(RetryError::Exhausted("boom")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_success_short_circuits() {
        let calls = AtomicU32::new(0);
        let result = retry(&CancellationToken::new(), config(5, Duration::ZERO), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, &str>(42) }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_at_most_count_plus_one_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<&str>> =
            retry(&CancellationToken::new(), config(3, Duration::ZERO), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("nope") }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(&CancellationToken::new(), config(3, Duration::ZERO), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_attempts() {
        let ctx = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<&str>> =
            retry(&ctx, config(10, Duration::from_millis(50)), || {
                calls.fetch_add(1, Ordering::SeqCst);
                ctx.cancel();
                async { Err("always") }
            })
            .await;
        assert_eq!(result, Err(RetryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_runs_nothing() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<&str>> =
            retry(&ctx, config(2, Duration::ZERO), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("never") }
            })
            .await;
        assert_eq!(result, Err(RetryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_elapses_between_attempts() {
        let start = tokio::time::Instant::now();
        let result: Result<(), RetryError<&str>> = retry(
            &CancellationToken::new(),
            config(2, Duration::from_millis(100)),
            || async { Err("slow") },
        )
        .await;
        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
