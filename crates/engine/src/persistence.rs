//! Persistence contract (spec §4.1). The engine only knows [`TaskStore`];
//! the concrete single-JSON-file implementation with dirty-flag coalesced
//! writes lives in `crates/storage`.

use async_trait::async_trait;

use crate::error::EngineError;
use crate::model::{DownloadStatus, Task, TaskStatus};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<Task>, EngineError>;
    async fn save_all(&self, tasks: &[Task]) -> Result<(), EngineError>;
    /// Marks the store dirty; the concrete implementation decides when the
    /// debounced write actually happens (spec §4.1 "10-60s coalescing window").
    fn mark_dirty(&self);
}

/// Applies the load-time demotions spec §4.1 requires: `Downloading` items
/// reset to `Waiting` with `speed=0`, and `Running`/`Extracting` tasks
/// demoted to `Paused`. Called by every `TaskStore::load_all` implementation
/// so the rule lives in one place regardless of the storage back-end.
pub fn apply_load_time_demotions(tasks: &mut [Task]) {
    for task in tasks.iter_mut() {
        for item in task.download_queue.iter_mut() {
            if item.status == DownloadStatus::Downloading {
                item.status = DownloadStatus::Waiting;
                item.speed = 0.0;
            }
        }
        if matches!(task.status, TaskStatus::Running | TaskStatus::Extracting) {
            task.status = TaskStatus::Paused;
        }
    }
}
