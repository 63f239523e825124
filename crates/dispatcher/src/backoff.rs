//! Backoff schedule and per-attempt deadline
//!
//! `compute_delay` is pure. `with_deadline` races a future against a timer and
//! a cancellation token; when either fires first the future is dropped, so any
//! in-flight request is abandoned and its eventual result discarded.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;

/// Upper bound on jitter as a fraction of the base delay (1/10).
const JITTER_DIVISOR: u64 = 10;

/// Exponential backoff: `initial_delay * 2^(attempt - 1)`.
///
/// `attempt` is 1-based; 0 is treated as 1. Saturates instead of overflowing.
pub fn compute_delay(attempt: u32, initial_delay: Duration) -> Duration {
    let exponent = attempt.max(1) - 1;
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    initial_delay.saturating_mul(factor)
}

/// Add up to 10% random jitter on top of `delay`.
pub fn with_jitter(delay: Duration) -> Duration {
    let max_extra = delay.as_millis() as u64 / JITTER_DIVISOR;
    if max_extra == 0 {
        return delay;
    }
    let extra = rand::rng().random_range(0..=max_extra);
    delay.saturating_add(Duration::from_millis(extra))
}

/// Why a deadline-bounded unit of work did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum DeadlineError<E> {
    #[error("{0}")]
    Failed(E),

    #[error("{0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,
}

/// Run `work` with a hard `timeout`, abandoning it on timeout or cancellation.
///
/// Cancellation is checked first, so an already-cancelled token never starts
/// the work.
pub async fn with_deadline<T, E, F>(
    work: F,
    timeout: Duration,
    timeout_message: &str,
    cancel: &CancellationToken,
) -> Result<T, DeadlineError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DeadlineError::Cancelled),
        result = tokio::time::timeout(timeout, work) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(DeadlineError::Failed(e)),
            Err(_) => Err(DeadlineError::Timeout(timeout_message.to_string())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn delay_doubles_per_attempt() {
        let initial = Duration::from_millis(100);
        assert_eq!(compute_delay(1, initial), Duration::from_millis(100));
        assert_eq!(compute_delay(2, initial), Duration::from_millis(200));
        assert_eq!(compute_delay(3, initial), Duration::from_millis(400));
        assert_eq!(compute_delay(4, initial), Duration::from_millis(800));
    }

    #[test]
    fn attempt_zero_treated_as_first() {
        let initial = Duration::from_secs(1);
        assert_eq!(compute_delay(0, initial), initial);
    }

    #[test]
    fn huge_attempt_saturates() {
        let delay = compute_delay(200, Duration::from_secs(1));
        assert_eq!(delay, Duration::from_secs(1).saturating_mul(u32::MAX));
    }

    #[test]
    fn jitter_bounded_to_ten_percent() {
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let d = with_jitter(base);
            assert!(d >= base && d <= Duration::from_millis(1100), "got {d:?}");
        }
    }

    #[test]
    fn jitter_skipped_for_tiny_delays() {
        assert_eq!(with_jitter(Duration::from_millis(5)), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn never_resolving_work_times_out_at_deadline() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let result: Result<(), DeadlineError<String>> = with_deadline(
            std::future::pending(),
            Duration::from_millis(500),
            "timed out after 500ms",
            &cancel,
        )
        .await;

        let elapsed = start.elapsed();
        assert!(matches!(result, Err(DeadlineError::Timeout(ref m)) if m == "timed out after 500ms"));
        assert!(elapsed >= Duration::from_millis(500), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(510), "fired late: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn fast_work_returns_value() {
        let cancel = CancellationToken::new();
        let result: Result<u32, DeadlineError<String>> = with_deadline(
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(7)
            },
            Duration::from_secs(1),
            "unused",
            &cancel,
        )
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn work_error_passes_through() {
        let cancel = CancellationToken::new();
        let result: Result<(), DeadlineError<String>> = with_deadline(
            async { Err("quota exceeded".to_string()) },
            Duration::from_secs(1),
            "unused",
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(DeadlineError::Failed(ref e)) if e == "quota exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_before_timeout() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result: Result<(), DeadlineError<String>> = with_deadline(
            std::future::pending(),
            Duration::from_secs(30),
            "unused",
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(DeadlineError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn already_cancelled_token_skips_work() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<u32, DeadlineError<String>> =
            with_deadline(async { Ok(1) }, Duration::from_secs(1), "unused", &cancel).await;
        assert!(matches!(result, Err(DeadlineError::Cancelled)));
    }
}
