//! Progress notification sink (spec §6 "Progress push", §4.1).
//!
//! Every material state change on a task is pushed through a
//! [`TaskObserver`] implementation. The engine ships two consumers of this:
//! `storage` marks its dirty flag from it, and `api` fans it out over a
//! WebSocket. The engine itself never depends on either.

use std::sync::Arc;

use crate::model::Task;

pub trait TaskObserver: Send + Sync {
    /// Called with the full task snapshot after any state change workers,
    /// the scanner, or the task manager make (spec §6 "rate of emission is
    /// governed by the workers, typically multiple per second").
    fn on_task_changed(&self, task: &Task);
}

/// No-op observer, used where no persistence/push layer is wired up (tests,
/// the `cli` crate's quick smoke runs).
pub struct NullObserver;

impl TaskObserver for NullObserver {
    fn on_task_changed(&self, _task: &Task) {}
}

pub type SharedObserver = Arc<dyn TaskObserver>;
