//! Bounded exponential-backoff retry.
//!
//! One primitive applied uniformly to uploads and downloads instead of
//! per-call-site retry loops. All non-cancellation errors are retried; the
//! budget is short, so permanent failures still surface quickly.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts beyond the first; an operation runs at most
    /// `max_attempts + 1` times.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Backoff before retry `attempt` (1-based): doubles from the base and
    /// is capped so cumulative sleep stays within `base_delay * max_attempts`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let exponential = self.base_delay.saturating_mul(1 << shift);
        let cap = self.base_delay.saturating_mul(self.max_attempts.max(1));
        exponential.min(cap)
    }
}

/// Run `op` under the retry policy. `on_retry(k)` fires before retry `k`
/// so the caller can record progress; cancellation during a backoff sleep
/// aborts immediately. On exhaustion the last attempt's error is returned.
pub async fn with_retry<T, Op, OpFut, Note, NoteFut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: Note,
    mut op: Op,
) -> Result<T>
where
    Op: FnMut() -> OpFut,
    OpFut: Future<Output = Result<T>>,
    Note: FnMut(u32) -> NoteFut,
    NoteFut: Future<Output = ()>,
{
    let mut last_error = None;

    for attempt in 0..=policy.max_attempts {
        if attempt > 0 {
            on_retry(attempt).await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(policy.backoff_delay(attempt)) => {}
            }
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(error) => {
                warn!(attempt = attempt + 1, error = %error, "attempt failed");
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| SyncError::Storage("retry budget exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }

    /// Fails the first `failures` calls, then succeeds, counting attempts.
    fn flaky_op(
        failures: u32,
    ) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<Result<u32>>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                std::future::ready(Err(SyncError::Storage(format!("boom {n}"))))
            } else {
                std::future::ready(Ok(n))
            }
        };
        (attempts, op)
    }

    #[tokio::test]
    async fn success_short_circuits() {
        let (attempts, op) = flaky_op(0);
        let cancel = CancellationToken::new();

        let result = with_retry(&fast_policy(3), &cancel, |_| async {}, op).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_n_times_takes_exactly_n_plus_one_attempts() {
        let (attempts, op) = flaky_op(3);
        let cancel = CancellationToken::new();

        let result = with_retry(&fast_policy(3), &cancel, |_| async {}, op).await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_error() {
        let (attempts, op) = flaky_op(10);
        let cancel = CancellationToken::new();

        let result = with_retry(&fast_policy(2), &cancel, |_| async {}, op).await;
        match result {
            Err(SyncError::Storage(message)) => assert_eq!(message, "boom 3"),
            other => panic!("expected last storage error, got {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn on_retry_sees_one_based_attempt_numbers() {
        let (_, op) = flaky_op(2);
        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        with_retry(
            &fast_policy(3),
            &cancel,
            move |attempt| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(attempt);
                }
            },
            op,
        )
        .await
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn cancellation_preempts_backoff_sleep() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
        };
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let result = with_retry(
            &policy,
            &cancel,
            |_| async {},
            || std::future::ready(Err::<(), _>(SyncError::Storage("always".into()))),
        )
        .await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancelled_operations_are_not_retried() {
        let (attempts, _) = flaky_op(0);
        let counter = attempts.clone();
        let cancel = CancellationToken::new();

        let result = with_retry(&fast_policy(5), &cancel, |_| async {}, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err::<(), _>(SyncError::Cancelled))
        })
        .await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_up_to_the_window_cap() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(10));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(15));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(15));
    }
}
