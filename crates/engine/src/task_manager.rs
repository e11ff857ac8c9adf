//! Task Manager (spec §4.7): the engine's full command surface — lifecycle,
//! queue maintenance, progress notification, and persistence coordination.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{DownloadStatus, ExportOptions, Task, TaskStatus};
use crate::mtproto::MtProtoClient;
use crate::notify::SharedObserver;
use crate::persistence::TaskStore;
use crate::scanner;
use crate::tdl::TdlBatcher;
use crate::worker_pool::{self, TaskRuntime, WorkerContext};

/// Extra items primed into the runtime channel when `adjust_concurrency`
/// grows the ceiling (spec §4.7 `adjust_concurrency`).
const PRIME_ON_GROWTH: usize = 5;

/// Sort-and-slice view over a task's item pool (spec §4.7 `get_queue`).
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueView {
    pub active: Vec<crate::model::DownloadItem>,
    pub waiting: Vec<crate::model::DownloadItem>,
    pub failed: Vec<crate::model::DownloadItem>,
    pub completed: Vec<crate::model::DownloadItem>,
}

struct TaskHandle {
    task: Arc<RwLock<Task>>,
    runtime: Arc<TaskRuntime>,
}

/// Directory layout handed to every task's worker pool (spec §6 "Export
/// directory layout").
pub struct DirectoryLayout {
    pub export_root: PathBuf,
    pub temp_dir: PathBuf,
}

/// Owns every live task's runtime state and exposes the full command
/// surface the control plane (HTTP adapter or CLI) drives.
pub struct EngineState {
    handles: DashMap<String, TaskHandle>,
    client: Arc<dyn MtProtoClient>,
    store: Arc<dyn TaskStore>,
    observer: SharedObserver,
    tdl: Option<Arc<TdlBatcher>>,
    layout_root: PathBuf,
}

impl EngineState {
    pub fn new(client: Arc<dyn MtProtoClient>, store: Arc<dyn TaskStore>, observer: SharedObserver, tdl: Option<Arc<TdlBatcher>>, layout_root: PathBuf) -> Self {
        Self {
            handles: DashMap::new(),
            client,
            store,
            observer,
            tdl,
            layout_root,
        }
    }

    /// Loads persisted tasks, applying the documented demotions, and
    /// registers each as a (not-yet-started) handle (spec §4.1).
    pub async fn restore(&self) -> Result<(), EngineError> {
        let mut tasks = self.store.load_all().await?;
        crate::persistence::apply_load_time_demotions(&mut tasks);
        for task in tasks {
            let ceiling = task.current_max_concurrent_downloads.unwrap_or(task.options.max_concurrent_downloads);
            let max = task.options.max_concurrent_downloads;
            let id = task.id.clone();
            self.handles.insert(
                id,
                TaskHandle {
                    task: Arc::new(RwLock::new(task)),
                    runtime: TaskRuntime::new(ceiling, max),
                },
            );
        }
        Ok(())
    }

    fn layout_for(&self, task: &Task) -> DirectoryLayout {
        let export_root = self.layout_root.join(task.export_directory_name());
        let temp_dir = self.layout_root.join("temp");
        DirectoryLayout { export_root, temp_dir }
    }

    fn get(&self, id: &str) -> Result<dashmap::mapref::one::Ref<'_, String, TaskHandle>, EngineError> {
        self.handles.get(id).ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
    }

    pub async fn create(&self, name: String, mut options: ExportOptions) -> Result<Task, EngineError> {
        options.clamp_concurrency();
        let id = Uuid::new_v4().to_string();
        let task = Task::new(id.clone(), name, options.clone(), chrono::Utc::now());
        let runtime = TaskRuntime::new(options.max_concurrent_downloads, options.max_concurrent_downloads);
        let snapshot = task.clone();
        self.handles.insert(
            id,
            TaskHandle {
                task: Arc::new(RwLock::new(task)),
                runtime,
            },
        );
        self.store.mark_dirty();
        Ok(snapshot)
    }

    /// Transitions from any non-`Running` state to `Running` and spawns the
    /// scan + worker-pool coroutines (spec §4.7 `start`, `_run_export`).
    pub async fn start(&self, id: &str) -> Result<(), EngineError> {
        let handle = self.get(id)?;
        let task_arc = handle.task.clone();
        let runtime = handle.runtime.clone();
        drop(handle);

        {
            let mut task = task_arc.write().await;
            if task.status == TaskStatus::Running {
                return Ok(());
            }
            task.started_at = Some(chrono::Utc::now());
            task.error = None;
            if task.export_name.is_none() {
                task.export_name = Some(task.export_directory_name());
            }
        }

        let layout = self.layout_for(&*task_arc.read().await);
        if let Err(e) = crate::fsperm::create_world_writable_dir(&layout.export_root).await {
            tracing::warn!(error = %e, path = %layout.export_root.display(), "failed to prepare export directory");
        }
        if let Err(e) = crate::fsperm::create_world_writable_dir(&layout.temp_dir).await {
            tracing::warn!(error = %e, path = %layout.temp_dir.display(), "failed to prepare temp directory");
        }

        let tdl_mode = task_arc.read().await.options.tdl_mode;
        let sniffer_dir = layout.temp_dir.clone();

        let ctx = Arc::new(WorkerContext {
            client: self.client.clone(),
            observer: self.observer.clone(),
            tdl: self.tdl.clone(),
            export_root: layout.export_root,
            temp_dir: layout.temp_dir,
        });

        if tdl_mode {
            let sniffer_task = task_arc.clone();
            let sniffer_observer = self.observer.clone();
            let sniffer_cancel = runtime.cancel.clone();
            tokio::spawn(async move {
                crate::tdl::run_disk_sniffer(sniffer_dir, sniffer_task, sniffer_observer, sniffer_cancel).await;
            });
        }

        let scan_task = task_arc.clone();
        let scan_client = self.client.clone();
        let scan_observer = self.observer.clone();
        let scan_cancel = runtime.cancel.clone();
        let scan_runtime = runtime.clone();
        tokio::spawn(async move {
            {
                let mut t = scan_task.write().await;
                scanner::scan_all_chats(scan_client.as_ref(), &mut t, &scan_observer, &scan_cancel).await.ok();
                t.status = TaskStatus::Running;
                let ids: Vec<String> = t
                    .download_queue
                    .iter()
                    .filter(|i| matches!(i.status, DownloadStatus::Waiting))
                    .map(|i| i.id.clone())
                    .collect();
                for id in ids {
                    scan_runtime.enqueue(id);
                }
                scan_observer.on_task_changed(&t);
            }
            worker_pool::supervise_pool(scan_task.clone(), scan_runtime.clone(), ctx).await;
        });

        let auto_resume_task = task_arc.clone();
        let auto_resume_runtime = runtime.clone();
        tokio::spawn(async move {
            worker_pool::auto_resume_sweep(auto_resume_task, auto_resume_runtime).await;
        });

        let completion_task = task_arc.clone();
        let completion_runtime = runtime.clone();
        let completion_observer = self.observer.clone();
        tokio::spawn(async move {
            worker_pool::completion_watcher(completion_task, completion_runtime, completion_observer).await;
        });

        Ok(())
    }

    /// Sets `Paused` and cancels in-flight worker attempts so blocking
    /// waits end immediately (spec §4.7 `pause`).
    pub async fn pause(&self, id: &str) -> Result<(), EngineError> {
        let handle = self.get(id)?;
        handle.task.write().await.status = TaskStatus::Paused;
        handle.runtime.set_paused(true);
        self.store.mark_dirty();
        Ok(())
    }

    /// Resets `Failed`/`Paused` items to `Waiting`, refills the runtime
    /// channel ordered `(not is_retry, message_id ascending)`, and restarts
    /// the worker pool (spec §4.7 `resume`).
    pub async fn resume(&self, id: &str) -> Result<(), EngineError> {
        let handle = self.get(id)?;
        let runtime = handle.runtime.clone();
        runtime.set_paused(false);

        let was_terminal = {
            let mut task = handle.task.write().await;
            let terminal = matches!(task.status, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled);
            if terminal {
                task.downloaded_media = 0;
                task.downloaded_size = 0;
            }
            for item in task.download_queue.iter_mut() {
                match item.status {
                    DownloadStatus::Failed => {
                        item.status = DownloadStatus::Waiting;
                        item.reset_progress();
                    }
                    DownloadStatus::Paused => item.status = DownloadStatus::Waiting,
                    _ => {}
                }
            }
            let mut ids: Vec<(bool, i64, String)> = task
                .download_queue
                .iter()
                .filter(|i| i.status == DownloadStatus::Waiting)
                .map(|i| (!i.is_retry, i.message_id, i.id.clone()))
                .collect();
            ids.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
            for (_, _, id) in ids {
                runtime.enqueue(id);
            }
            terminal
        };
        drop(handle);

        self.store.mark_dirty();
        self.start(id).await?;
        let _ = was_terminal;
        Ok(())
    }

    pub async fn cancel(&self, id: &str) -> Result<(), EngineError> {
        let handle = self.get(id)?;
        handle.task.write().await.status = TaskStatus::Cancelled;
        handle.runtime.cancel_all();
        self.store.mark_dirty();
        Ok(())
    }

    pub async fn pause_item(&self, id: &str, item_id: &str) -> Result<(), EngineError> {
        let handle = self.get(id)?;
        {
            let mut task = handle.task.write().await;
            if let Some(item) = task.get_item_mut(item_id) {
                item.status = DownloadStatus::Paused;
                item.is_manually_paused = true;
            } else {
                return Err(EngineError::ItemNotFound(item_id.to_string()));
            }
        }
        handle.runtime.cancel_item(item_id);
        self.store.mark_dirty();
        Ok(())
    }

    pub async fn resume_item(&self, id: &str, item_id: &str) -> Result<(), EngineError> {
        let handle = self.get(id)?;
        let was_completed = {
            let mut task = handle.task.write().await;
            let item = task.get_item_mut(item_id).ok_or_else(|| EngineError::ItemNotFound(item_id.to_string()))?;
            item.status = DownloadStatus::Waiting;
            item.is_manually_paused = false;
            item.resume_timestamp = chrono::Utc::now().timestamp() as f64;
            task.status == TaskStatus::Completed
        };
        handle.runtime.enqueue(item_id.to_string());
        self.store.mark_dirty();
        if was_completed {
            drop(handle);
            self.start(id).await?;
        }
        Ok(())
    }

    pub async fn retry_item(&self, id: &str, item_id: &str) -> Result<(), EngineError> {
        let handle = self.get(id)?;
        {
            let mut task = handle.task.write().await;
            let item = task.get_item_mut(item_id).ok_or_else(|| EngineError::ItemNotFound(item_id.to_string()))?;
            item.status = DownloadStatus::Waiting;
            item.is_manually_paused = false;
            item.is_retry = true;
            item.resume_timestamp = chrono::Utc::now().timestamp() as f64;
            item.reset_progress();
        }
        handle.runtime.enqueue(item_id.to_string());
        self.store.mark_dirty();
        Ok(())
    }

    pub async fn cancel_item(&self, id: &str, item_id: &str) -> Result<(), EngineError> {
        let handle = self.get(id)?;
        {
            let mut task = handle.task.write().await;
            let item = task.get_item_mut(item_id).ok_or_else(|| EngineError::ItemNotFound(item_id.to_string()))?;
            item.status = DownloadStatus::Skipped;
        }
        handle.runtime.cancel_item(item_id);
        self.store.mark_dirty();
        Ok(())
    }

    pub async fn retry_all_failed(&self, id: &str) -> Result<u32, EngineError> {
        let handle = self.get(id)?;
        let mut count = 0u32;
        let mut task = handle.task.write().await;
        for item in task.download_queue.iter_mut() {
            if item.status == DownloadStatus::Failed {
                item.status = DownloadStatus::Waiting;
                item.is_retry = true;
                item.reset_progress();
                count += 1;
            }
        }
        drop(task);
        self.store.mark_dirty();
        Ok(count)
    }

    /// Clamps and applies new concurrency options, mirroring
    /// `max_concurrent` to the client immediately and priming up to 5 extra
    /// items if the ceiling grew (spec §4.7 `adjust_concurrency`).
    pub async fn adjust_concurrency(&self, id: &str, max_concurrent: Option<u32>, parallel_chunk: Option<u32>) -> Result<(), EngineError> {
        let handle = self.get(id)?;
        let mut task = handle.task.write().await;
        let old_ceiling = handle.runtime.adaptive.ceiling();

        if let Some(v) = max_concurrent {
            task.options.max_concurrent_downloads = v.clamp(1, 20);
        }
        if let Some(v) = parallel_chunk {
            task.options.parallel_chunk_connections = v.clamp(1, 8);
        }
        task.options.clamp_concurrency();
        self.client.set_max_concurrent_transmissions(task.options.max_concurrent_downloads);
        handle.runtime.adaptive.raise_growth_cap(task.options.max_concurrent_downloads);

        if task.options.max_concurrent_downloads > old_ceiling {
            let extra: Vec<String> = task
                .download_queue
                .iter()
                .filter(|i| i.status == DownloadStatus::Waiting)
                .take(PRIME_ON_GROWTH)
                .map(|i| i.id.clone())
                .collect();
            drop(task);
            for id in extra {
                handle.runtime.enqueue(id);
            }
        }

        self.store.mark_dirty();
        Ok(())
    }

    /// Spawns the verifier if the task is not `Running` (spec §4.7
    /// `verify_integrity`, §4.7.1).
    pub async fn verify_integrity(&self, id: &str) -> Result<crate::verifier::VerifyResult, EngineError> {
        let handle = self.get(id)?;
        let task_arc = handle.task.clone();
        let runtime = handle.runtime.clone();
        drop(handle);

        {
            let task = task_arc.read().await;
            if task.status == TaskStatus::Running {
                return Err(EngineError::InvalidState("cannot verify a running task".to_string()));
            }
        }

        let layout = self.layout_for(&*task_arc.read().await);
        let mut task = task_arc.write().await;
        let result = crate::verifier::run_verifier(self.client.as_ref(), &mut task, &layout.export_root, &layout.temp_dir, &self.observer, &runtime.cancel).await?;
        task.status = TaskStatus::Paused;
        self.observer.on_task_changed(&task);
        drop(task);
        self.store.mark_dirty();
        Ok(result)
    }

    /// Produces the four sorted slices the control plane renders (spec
    /// §4.7 `get_queue`).
    pub async fn get_queue(&self, id: &str, limit: usize, reversed: bool) -> Result<QueueView, EngineError> {
        let handle = self.get(id)?;
        let task = handle.task.read().await;
        let mut view = QueueView::default();

        for item in &task.download_queue {
            let bucket = match item.status {
                DownloadStatus::Downloading | DownloadStatus::Paused => &mut view.active,
                DownloadStatus::Waiting if item.progress > 0.0 => &mut view.active,
                DownloadStatus::Waiting => &mut view.waiting,
                DownloadStatus::Failed => &mut view.failed,
                DownloadStatus::Completed | DownloadStatus::Skipped => &mut view.completed,
            };
            bucket.push(item.clone());
        }

        for bucket in [&mut view.active, &mut view.waiting, &mut view.failed, &mut view.completed] {
            bucket.sort_by_key(|i| i.message_id);
            if reversed {
                bucket.reverse();
            }
            bucket.truncate(limit.max(1));
        }

        Ok(view)
    }

    pub async fn snapshot(&self, id: &str) -> Result<Task, EngineError> {
        Ok(self.get(id)?.task.read().await.clone())
    }

    pub async fn list_snapshots(&self) -> Vec<Task> {
        let mut out = Vec::with_capacity(self.handles.len());
        for entry in self.handles.iter() {
            out.push(entry.task.read().await.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtproto::MockMtProtoClient;
    use crate::notify::NullObserver;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct InMemoryStore {
        tasks: StdMutex<Vec<Task>>,
    }

    #[async_trait]
    impl TaskStore for InMemoryStore {
        async fn load_all(&self) -> Result<Vec<Task>, EngineError> {
            Ok(self.tasks.lock().unwrap().clone())
        }
        async fn save_all(&self, tasks: &[Task]) -> Result<(), EngineError> {
            *self.tasks.lock().unwrap() = tasks.to_vec();
            Ok(())
        }
        fn mark_dirty(&self) {}
    }

    fn state() -> EngineState {
        EngineState::new(
            Arc::new(MockMtProtoClient::new(vec![])),
            Arc::new(InMemoryStore { tasks: StdMutex::new(vec![]) }),
            Arc::new(NullObserver),
            None,
            PathBuf::from("/tmp/tg-export-test"),
        )
    }

    #[tokio::test]
    async fn create_allocates_id_and_clamps_options() {
        let state = state();
        let options = ExportOptions {
            max_concurrent_downloads: 999,
            export_path: "/x".to_string(),
            ..Default::default()
        };
        let task = state.create("n".to_string(), options).await.unwrap();
        assert_eq!(task.options.max_concurrent_downloads, 20);
        assert!(!task.id.is_empty());
    }

    #[tokio::test]
    async fn start_pins_export_name_on_first_run() {
        let state = state();
        let task = state
            .create(
                "My Task".to_string(),
                ExportOptions {
                    export_path: "/x".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(task.export_name.is_none());

        state.start(&task.id).await.unwrap();
        let snapshot = state.snapshot(&task.id).await.unwrap();
        assert_eq!(snapshot.export_name, Some(snapshot.export_directory_name()));
    }

    #[tokio::test]
    async fn pause_item_not_found_errors() {
        let state = state();
        let task = state.create("n".to_string(), ExportOptions::default()).await.unwrap();
        let err = state.pause_item(&task.id, "missing").await.unwrap_err();
        assert!(matches!(err, EngineError::ItemNotFound(_)));
    }

    #[tokio::test]
    async fn retry_all_failed_flips_items_and_counts() {
        let state = state();
        let task = state.create("n".to_string(), ExportOptions::default()).await.unwrap();
        {
            let handle = state.handles.get(&task.id).unwrap();
            let mut t = handle.task.write().await;
            let mut item = crate::model::DownloadItem::new(1, 1, "f".into(), 10, crate::model::MediaType::Document, "f".into());
            item.status = DownloadStatus::Failed;
            t.download_queue.push(item);
        }
        let count = state.retry_all_failed(&task.id).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn adjust_concurrency_raises_adaptive_growth_cap_past_shrunk_ceiling() {
        let state = state();
        let task = state
            .create(
                "n".to_string(),
                ExportOptions {
                    max_concurrent_downloads: 5,
                    export_path: "/x".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        {
            let handle = state.handles.get(&task.id).unwrap();
            handle.runtime.adaptive.on_flood_wait(state.client.as_ref());
            assert_eq!(handle.runtime.adaptive.ceiling(), 3);
        }

        state.adjust_concurrency(&task.id, Some(15), None).await.unwrap();

        let handle = state.handles.get(&task.id).unwrap();
        for _ in 0..15 * 8 {
            handle.runtime.adaptive.on_success(state.client.as_ref());
        }
        assert!(handle.runtime.adaptive.ceiling() > 5, "growth cap should allow growing past the original max");
    }

    #[tokio::test]
    async fn get_queue_buckets_by_status() {
        let state = state();
        let task = state.create("n".to_string(), ExportOptions::default()).await.unwrap();
        {
            let handle = state.handles.get(&task.id).unwrap();
            let mut t = handle.task.write().await;
            let mut completed = crate::model::DownloadItem::new(1, 1, "a".into(), 10, crate::model::MediaType::Document, "a".into());
            completed.status = DownloadStatus::Completed;
            let waiting = crate::model::DownloadItem::new(1, 2, "b".into(), 10, crate::model::MediaType::Document, "b".into());
            t.download_queue.push(completed);
            t.download_queue.push(waiting);
        }
        let view = state.get_queue(&task.id, 100, false).await.unwrap();
        assert_eq!(view.completed.len(), 1);
        assert_eq!(view.waiting.len(), 1);
    }
}
