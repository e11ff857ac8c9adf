//! Adaptive Concurrency Controller (spec §4.4).
//!
//! Tracks one ceiling per task: shrinks hard on any flood-wait signal,
//! grows slowly on a run of successes. The worker pool consults
//! [`AdaptiveController::ceiling`] before admitting new downloads and calls
//! [`AdaptiveController::on_flood_wait`] / [`AdaptiveController::on_success`]
//! as items finish.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::mtproto::MtProtoClient;

/// Consecutive successes required before the ceiling grows by one (spec §4.4).
pub const GROWTH_STREAK: u32 = 15;

/// Amount the ceiling shrinks on a flood-wait signal (spec §4.4).
const SHRINK_STEP: u32 = 2;

/// Per-task adaptive concurrency ceiling, mirroring
/// `Task.current_max_concurrent_downloads` / `consecutive_success_count`.
///
/// Kept as a standalone atomics-backed struct (rather than locking the whole
/// `Task`) so the worker pool can read the ceiling from many concurrent
/// download futures without contending on the task's own state lock.
pub struct AdaptiveController {
    ceiling: AtomicU32,
    consecutive_success: AtomicU32,
    max_concurrent_downloads: AtomicU32,
}

/// Result of a ceiling-changing event, telling the caller what it needs to
/// do to the worker pool as a consequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CeilingChange {
    pub old_ceiling: u32,
    pub new_ceiling: u32,
}

impl AdaptiveController {
    pub fn new(starting_ceiling: u32, max_concurrent_downloads: u32) -> Self {
        Self {
            ceiling: AtomicU32::new(starting_ceiling.clamp(1, max_concurrent_downloads.max(1))),
            consecutive_success: AtomicU32::new(0),
            max_concurrent_downloads: AtomicU32::new(max_concurrent_downloads.max(1)),
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling.load(Ordering::SeqCst)
    }

    /// Raises the controller's own growth cap so a later `on_success` run can
    /// grow the ceiling past a value that was only shrunk at construction
    /// time — used by `adjust_concurrency` when the operator raises
    /// `max_concurrent_downloads` after a flood-wait shrink (spec §4.7
    /// `adjust_concurrency`, §4.4). Never lowers the cap: a downward
    /// adjustment is enforced by clamping the ceiling itself, not here.
    pub fn raise_growth_cap(&self, new_cap: u32) {
        self.max_concurrent_downloads.fetch_max(new_cap.max(1), Ordering::SeqCst);
    }

    /// Shrink rule: `ceiling <- max(1, ceiling - 2)`, reset the success
    /// streak, and mirror the new ceiling to the client's transmission cap
    /// (spec §4.4 "on any flood-wait").
    pub fn on_flood_wait(&self, client: &dyn MtProtoClient) -> CeilingChange {
        self.consecutive_success.store(0, Ordering::SeqCst);
        let old = self.ceiling.load(Ordering::SeqCst);
        let new = old.saturating_sub(SHRINK_STEP).max(1);
        self.ceiling.store(new, Ordering::SeqCst);
        client.set_max_concurrent_transmissions(new);
        CeilingChange {
            old_ceiling: old,
            new_ceiling: new,
        }
    }

    /// Grow rule: on the 15th consecutive success, raise the ceiling by one
    /// (capped at `max_concurrent_downloads`) and reset the streak (spec §4.4
    /// "on a run of 15 successes").
    pub fn on_success(&self, client: &dyn MtProtoClient) -> Option<CeilingChange> {
        let streak = self.consecutive_success.fetch_add(1, Ordering::SeqCst) + 1;
        if streak < GROWTH_STREAK {
            return None;
        }
        self.consecutive_success.store(0, Ordering::SeqCst);
        let cap = self.max_concurrent_downloads.load(Ordering::SeqCst);
        let old = self.ceiling.load(Ordering::SeqCst);
        if old >= cap {
            return None;
        }
        let new = (old + 1).min(cap);
        if new == old {
            return None;
        }
        self.ceiling.store(new, Ordering::SeqCst);
        client.set_max_concurrent_transmissions(new);
        Some(CeilingChange {
            old_ceiling: old,
            new_ceiling: new,
        })
    }

    pub fn consecutive_success_count(&self) -> u32 {
        self.consecutive_success.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtproto::MockMtProtoClient;

    #[test]
    fn shrinks_by_two_on_flood_wait() {
        let controller = AdaptiveController::new(10, 20);
        let client = MockMtProtoClient::new(vec![]);
        let change = controller.on_flood_wait(&client);
        assert_eq!(change.old_ceiling, 10);
        assert_eq!(change.new_ceiling, 8);
        assert_eq!(controller.ceiling(), 8);
        assert_eq!(client.max_transmissions(), 8);
    }

    #[test]
    fn shrink_floors_at_one() {
        let controller = AdaptiveController::new(2, 20);
        let client = MockMtProtoClient::new(vec![]);
        controller.on_flood_wait(&client);
        assert_eq!(controller.ceiling(), 1);
        controller.on_flood_wait(&client);
        assert_eq!(controller.ceiling(), 1);
    }

    #[test]
    fn flood_wait_resets_success_streak() {
        let controller = AdaptiveController::new(10, 20);
        let client = MockMtProtoClient::new(vec![]);
        for _ in 0..10 {
            controller.on_success(&client);
        }
        assert_eq!(controller.consecutive_success_count(), 10);
        controller.on_flood_wait(&client);
        assert_eq!(controller.consecutive_success_count(), 0);
    }

    #[test]
    fn grows_by_one_after_fifteen_successes() {
        let controller = AdaptiveController::new(5, 20);
        let client = MockMtProtoClient::new(vec![]);
        let mut last_change = None;
        for _ in 0..15 {
            last_change = controller.on_success(&client);
        }
        assert_eq!(
            last_change,
            Some(CeilingChange {
                old_ceiling: 5,
                new_ceiling: 6
            })
        );
        assert_eq!(controller.ceiling(), 6);
        assert_eq!(client.max_transmissions(), 6);
    }

    #[test]
    fn growth_resets_streak_and_caps_at_max() {
        let controller = AdaptiveController::new(20, 20);
        let client = MockMtProtoClient::new(vec![]);
        for _ in 0..15 {
            controller.on_success(&client);
        }
        assert_eq!(controller.ceiling(), 20);
        assert_eq!(controller.consecutive_success_count(), 0);
    }

    #[test]
    fn raising_growth_cap_lets_ceiling_grow_past_original_max() {
        let controller = AdaptiveController::new(10, 10);
        let client = MockMtProtoClient::new(vec![]);
        controller.on_flood_wait(&client);
        controller.on_flood_wait(&client);
        assert_eq!(controller.ceiling(), 6);

        controller.raise_growth_cap(20);
        for _ in 0..15 * 14 {
            // fourteen growth steps of 1 each, 15 successes per step
            controller.on_success(&client);
        }
        assert_eq!(controller.ceiling(), 20);
    }

    #[test]
    fn no_growth_before_streak_reached() {
        let controller = AdaptiveController::new(5, 20);
        let client = MockMtProtoClient::new(vec![]);
        for _ in 0..14 {
            assert!(controller.on_success(&client).is_none());
        }
        assert_eq!(controller.ceiling(), 5);
    }
}
