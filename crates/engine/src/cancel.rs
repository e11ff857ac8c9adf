//! Structured cancellation scopes (spec §9 "Ad-hoc cancellation propagation
//! -> structured cancellation").
//!
//! Each task owns a [`CancelToken`]; each worker and each parallel-chunk
//! fan-out derives a child token. Cancelling the task cancels every
//! descendant scope immediately, including in-flight flood-wait sleeps,
//! which is what makes "pause now" actually immediate.

use std::time::Duration;

pub use tokio_util::sync::CancellationToken as CancelToken;

/// Sleeps for `duration` unless `token` is cancelled first. Returns `true`
/// if the sleep ran to completion, `false` if it was interrupted.
pub async fn sleep_cancellable(token: &CancelToken, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = token.cancelled() => false,
    }
}
