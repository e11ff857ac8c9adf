//! Fans a [`TaskObserver`] callback out to per-task WebSocket subscribers
//! (spec §6 "Progress push"). `storage`'s dirty flag and this sink both
//! listen to the same `on_task_changed` calls; the engine never knows
//! either consumer exists.

use dashmap::DashMap;
use engine::model::Task;
use engine::notify::TaskObserver;
use tokio::sync::broadcast;

/// Bounded so a slow WebSocket client can't pin unbounded memory; a lagging
/// receiver just misses the oldest updates (`broadcast::error::RecvError::Lagged`),
/// which the WS handler treats as "skip ahead", since only the latest task
/// snapshot matters for rendering.
const CHANNEL_CAPACITY: usize = 64;

pub struct WsObserver {
    channels: DashMap<String, broadcast::Sender<Task>>,
}

impl WsObserver {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    pub fn subscribe(&self, task_id: &str) -> broadcast::Receiver<Task> {
        self.channels
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

impl Default for WsObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskObserver for WsObserver {
    fn on_task_changed(&self, task: &Task) {
        let tx = self.channels.entry(task.id.clone()).or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        // No subscribers is the common case between WS connections; the
        // send failing just means nobody's listening right now.
        let _ = tx.send(task.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_before_change_receives_the_update() {
        let observer = WsObserver::new();
        let mut rx = observer.subscribe("t1");
        let mut task = Task::new("t1".into(), "n".into(), engine::model::ExportOptions::default(), chrono::Utc::now());
        task.downloaded_media = 3;
        observer.on_task_changed(&task);

        let received = rx.try_recv().unwrap();
        assert_eq!(received.downloaded_media, 3);
    }

    #[test]
    fn change_with_no_subscriber_does_not_panic() {
        let observer = WsObserver::new();
        let task = Task::new("t2".into(), "n".into(), engine::model::ExportOptions::default(), chrono::Utc::now());
        observer.on_task_changed(&task);
    }
}
