//! Retry Policy (spec §4.2): error classification, backoff delay, and the
//! generic retry wrapper used by both the single-stream and chunked
//! download paths.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::cancel::CancelToken;
use crate::error::{EngineError, ErrorKind};

/// Computes the delay before the next retry attempt (spec §4.2).
///
/// `FloodWait(n)` gets `n + uniform(1,3) + 2` seconds of safety margin;
/// everything else follows `retry_delay * 2^attempt`, capped at 60s.
pub fn retry_delay(kind: &ErrorKind, attempt: u32, base_retry_delay: f64) -> Duration {
    match kind {
        ErrorKind::FloodWait(n) => {
            let jitter: f64 = rand::thread_rng().gen_range(1.0..3.0);
            Duration::from_secs_f64(*n as f64 + jitter + 2.0)
        }
        _ => {
            let delay = base_retry_delay * 2f64.powi(attempt as i32);
            Duration::from_secs_f64(delay.min(60.0))
        }
    }
}

/// Outcome of a retried download attempt.
pub struct RetryOutcome<T> {
    pub value: Option<T>,
    pub error: Option<EngineError>,
}

/// Runs `attempt_fn` up to `max_retries` times, honouring the Retry Policy's
/// classification and delay rules. `on_flood_wait` is invoked synchronously
/// with the wait seconds *before* sleeping, so callers (the Adaptive
/// Concurrency Controller) can react without waiting for the sleep to
/// finish (spec §4.2).
///
/// A `FileReferenceExpired` classification triggers `on_file_ref_expired`
/// once before the next attempt, so the caller can refetch the message.
///
/// `cancel` interrupts a pending backoff/flood-wait sleep immediately, the
/// same way a worker's attempt token interrupts an in-flight transfer (spec
/// §4.7 `pause`: "cancel in-flight worker tasks so blocking waits... end
/// immediately").
pub async fn download_with_retry<T, F, Fut>(
    max_retries: u32,
    base_retry_delay: f64,
    mut attempt_fn: F,
    on_flood_wait: impl Fn(u32),
    mut on_file_ref_expired: impl FnMut(),
    cancel: &CancelToken,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut last_error = None;

    for attempt in 0..max_retries {
        match attempt_fn(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    value: Some(value),
                    error: None,
                }
            }
            Err(EngineError::Cancelled) => {
                return RetryOutcome {
                    value: None,
                    error: Some(EngineError::Cancelled),
                };
            }
            Err(err) => {
                let kind = err.kind().cloned().unwrap_or(ErrorKind::Unknown);

                if !kind.is_retryable() {
                    last_error = Some(err);
                    break;
                }

                if let ErrorKind::FloodWait(n) = &kind {
                    on_flood_wait(*n);
                }
                if kind == ErrorKind::FileReferenceExpired {
                    on_file_ref_expired();
                }

                last_error = Some(err);

                if attempt + 1 < max_retries {
                    let delay = retry_delay(&kind, attempt, base_retry_delay);
                    if !crate::cancel::sleep_cancellable(cancel, delay).await {
                        return RetryOutcome {
                            value: None,
                            error: Some(EngineError::Cancelled),
                        };
                    }
                }
            }
        }
    }

    RetryOutcome {
        value: None,
        error: last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn flood_wait_delay_has_safety_margin() {
        let d = retry_delay(&ErrorKind::FloodWait(5), 0, 2.0);
        assert!(d.as_secs_f64() >= 5.0 + 1.0 + 2.0);
        assert!(d.as_secs_f64() <= 5.0 + 3.0 + 2.0 + 0.001);
    }

    #[test]
    fn exponential_backoff_caps_at_60() {
        let d = retry_delay(&ErrorKind::Unknown, 10, 2.0);
        assert_eq!(d.as_secs_f64(), 60.0);
    }

    #[test]
    fn exponential_backoff_grows() {
        let d0 = retry_delay(&ErrorKind::ConnectionLost, 0, 2.0);
        let d1 = retry_delay(&ErrorKind::ConnectionLost, 1, 2.0);
        let d2 = retry_delay(&ErrorKind::ConnectionLost, 2, 2.0);
        assert_eq!(d0.as_secs_f64(), 2.0);
        assert_eq!(d1.as_secs_f64(), 4.0);
        assert_eq!(d2.as_secs_f64(), 8.0);
    }

    #[tokio::test]
    async fn retries_retryable_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let outcome = download_with_retry(
            5,
            0.001,
            move |_attempt| {
                let calls = calls2.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(EngineError::classified(ErrorKind::ConnectionLost, "boom"))
                    } else {
                        Ok(42)
                    }
                }
            },
            |_| {},
            || {},
            &CancelToken::new(),
        )
        .await;
        assert_eq!(outcome.value, Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_stop_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let outcome: RetryOutcome<()> = download_with_retry(
            5,
            0.001,
            move |_attempt| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::classified(ErrorKind::PeerInvalid, "nope"))
                }
            },
            |_| {},
            || {},
            &CancelToken::new(),
        )
        .await;
        assert!(outcome.value.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn flood_wait_callback_fires_before_sleep() {
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = seen.clone();
        let _outcome: RetryOutcome<()> = download_with_retry(
            1,
            0.001,
            move |_attempt| async move { Err(EngineError::classified(ErrorKind::FloodWait(0), "flood")) },
            move |secs| {
                seen2.store(secs, Ordering::SeqCst);
            },
            || {},
            &CancelToken::new(),
        )
        .await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelling_interrupts_the_backoff_sleep() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let cancel = CancelToken::new();
        let cancel2 = cancel.clone();

        let handle = tokio::spawn(async move {
            download_with_retry(
                5,
                60.0,
                move |_attempt| {
                    let calls = calls2.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(EngineError::classified(ErrorKind::ConnectionLost, "boom"))
                    }
                },
                |_| {},
                || {},
                &cancel2,
            )
            .await
        });

        tokio::task::yield_now().await;
        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("cancellation should interrupt the backoff sleep immediately")
            .unwrap();
        assert!(outcome.value.is_none());
        assert!(matches!(outcome.error, Some(EngineError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
