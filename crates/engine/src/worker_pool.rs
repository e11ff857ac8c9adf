//! Download Worker Pool (spec §4.5): per-task cooperative workers consuming
//! a priority-aware queue, each owning exactly one in-flight item.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock, Semaphore};

use crate::adaptive::AdaptiveController;
use crate::cancel::{sleep_cancellable, CancelToken};
use crate::chunked;
use crate::error::{EngineError, ErrorKind};
use crate::model::{DownloadItem, DownloadStatus, Task, TaskStatus};
use crate::mtproto::MtProtoClient;
use crate::notify::SharedObserver;
use crate::retry;
use crate::tdl::TdlBatcher;

/// Minimum spacing between successive worker starts (spec §4.5 "startup gate").
const STARTUP_GATE: Duration = Duration::from_secs(5);
/// Worker-Manager reconciliation period (spec §4.5).
const RECONCILE_EVERY: Duration = Duration::from_secs(3);
/// Stagger between replacement workers spawned in one reconcile pass.
const RECONCILE_STAGGER: Duration = Duration::from_secs(2);
/// Admission-gate poll interval while over the concurrency ceiling.
const ADMISSION_POLL: Duration = Duration::from_millis(500);
/// Admission-gate poll interval while the task is globally paused.
const ADMISSION_PAUSED_POLL: Duration = Duration::from_secs(1);
/// A worker forces a P3 (FIFO) pick at least this often, even when P1/P2
/// candidates are continuously available (spec §9 "P3 starvation" resolution).
const STARVATION_GUARD_EVERY: u32 = 4;
/// Auto-resume sweep period (spec §4.5 "background auto-resume sweeper").
const AUTO_RESUME_EVERY: Duration = Duration::from_secs(300);
/// Natural-termination poll period (spec §4.7 "on natural termination").
const COMPLETION_CHECK_EVERY: Duration = Duration::from_secs(5);
/// Zero-progress window before a download is considered stuck (spec §4.5 step 6, §5).
pub const STUCK_TIMEOUT: Duration = Duration::from_secs(600);
/// How often the stuck-download watchdog checks the zero-progress window.
const STUCK_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
enum QueueMessage {
    Item(String),
    Drain,
}

/// Per-task runtime state that is never persisted (spec §3 "Per-task
/// runtime"): the channel feeding workers, the ownership map, the chunk
/// fan-out semaphore, and the adaptive ceiling.
pub struct TaskRuntime {
    pub cancel: CancelToken,
    paused: AtomicBool,
    /// worker→item ownership (spec §8 "Ownership uniqueness"): presence of
    /// a key means some worker currently holds that item, and carries the
    /// cancel token for that specific download attempt.
    ownership: DashMap<String, CancelToken>,
    worker_cancels: DashMap<usize, CancelToken>,
    queue_tx: mpsc::UnboundedSender<QueueMessage>,
    queue_rx: AsyncMutex<mpsc::UnboundedReceiver<QueueMessage>>,
    /// Picks since this worker last forced a P3 dequeue (spec §9 "P3
    /// starvation" resolution); indexed per worker in `select_item`.
    pick_counts: DashMap<usize, u32>,
    pub adaptive: AdaptiveController,
    pub global_chunk_sem: Arc<Semaphore>,
    last_worker_start: AsyncMutex<Option<Instant>>,
    next_worker_index: AtomicUsize,
}

impl TaskRuntime {
    pub fn new(starting_ceiling: u32, max_concurrent_downloads: u32) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            cancel: CancelToken::new(),
            paused: AtomicBool::new(false),
            ownership: DashMap::new(),
            worker_cancels: DashMap::new(),
            queue_tx,
            queue_rx: AsyncMutex::new(queue_rx),
            pick_counts: DashMap::new(),
            adaptive: AdaptiveController::new(starting_ceiling, max_concurrent_downloads),
            global_chunk_sem: Arc::new(Semaphore::new(chunked::global_chunk_permits(max_concurrent_downloads))),
            last_worker_start: AsyncMutex::new(None),
            next_worker_index: AtomicUsize::new(0),
        })
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        if paused {
            self.cancel_in_flight();
        }
    }

    pub fn enqueue(&self, item_id: String) {
        let _ = self.queue_tx.send(QueueMessage::Item(item_id));
    }

    /// Pushes one drain sentinel per currently-registered worker, so every
    /// blocked P3 `recv` unblocks and exits (spec §4.5 step 2 "`nil` sentinel").
    pub fn drain_and_exit(&self) {
        let count = self.worker_cancels.len().max(1);
        for _ in 0..count {
            let _ = self.queue_tx.send(QueueMessage::Drain);
        }
    }

    pub fn owned_count(&self) -> usize {
        self.ownership.len()
    }

    /// Cancels every in-flight download attempt without tearing down the
    /// workers themselves — used for pause (spec §5 "cancelling a worker
    /// cancels its current download").
    fn cancel_in_flight(&self) {
        for entry in self.ownership.iter() {
            entry.value().cancel();
        }
    }

    /// Per-item cancel: cancels the owning worker's current attempt if any
    /// (spec §4.7 `pause_item`/`cancel_item`).
    pub fn cancel_item(&self, item_id: &str) {
        if let Some(entry) = self.ownership.get(item_id) {
            entry.value().cancel();
        }
    }

    pub fn cancel_all(&self) {
        self.cancel.cancel();
        for entry in self.worker_cancels.iter() {
            entry.value().cancel();
        }
    }
}

/// P1/P2 priority pick over the persistent pool (spec §4.5 step 2). Returns
/// `None` when neither tier has an unowned candidate, in which case the
/// caller falls through to the P3 channel dequeue.
pub fn pick_priority_item(task: &mut Task, ownership: &DashMap<String, CancelToken>) -> Option<String> {
    let mut best: Option<usize> = None;
    for (i, item) in task.download_queue.iter().enumerate() {
        if item.status == DownloadStatus::Waiting && item.resume_timestamp > 0.0 && !ownership.contains_key(&item.id) {
            let better = match best {
                None => true,
                Some(b) => item.resume_timestamp > task.download_queue[b].resume_timestamp,
            };
            if better {
                best = Some(i);
            }
        }
    }
    if let Some(i) = best {
        task.download_queue[i].resume_timestamp = 0.0;
        return Some(task.download_queue[i].id.clone());
    }

    task.download_queue
        .iter()
        .find(|item| item.status == DownloadStatus::Waiting && item.is_retry && !ownership.contains_key(&item.id))
        .map(|item| item.id.clone())
}

/// Whether the admission gate should keep waiting (spec §4.5 step 3):
/// true while the worker→item map already holds at least `ceiling` items.
pub fn should_wait_for_admission(currently_owned: usize, ceiling: u32) -> bool {
    currently_owned >= ceiling as usize
}

/// P3 FIFO pick result.
enum FifoPick {
    Item(String),
    Drain,
}

async fn pick_fifo_item(runtime: &TaskRuntime) -> Option<FifoPick> {
    let mut rx = runtime.queue_rx.lock().await;
    loop {
        match rx.recv().await {
            Some(QueueMessage::Item(id)) => {
                if runtime.ownership.contains_key(&id) {
                    continue;
                }
                return Some(FifoPick::Item(id));
            }
            Some(QueueMessage::Drain) => return Some(FifoPick::Drain),
            None => return None,
        }
    }
}

/// Collaborators a worker needs that don't change across the task's
/// lifetime; bundled to keep `run_worker`'s signature manageable.
pub struct WorkerContext {
    pub client: Arc<dyn MtProtoClient>,
    pub observer: SharedObserver,
    pub tdl: Option<Arc<TdlBatcher>>,
    pub export_root: PathBuf,
    pub temp_dir: PathBuf,
}

/// Runs one worker's main loop (spec §4.5 steps 1-12) until the task is
/// cancelled or this worker's index is reconciled away.
pub async fn run_worker(index: usize, task: Arc<RwLock<Task>>, runtime: Arc<TaskRuntime>, ctx: Arc<WorkerContext>) {
    let worker_cancel = CancelToken::new();
    runtime.worker_cancels.insert(index, worker_cancel.clone());
    gate_startup(&runtime).await;

    loop {
        if runtime.cancel.is_cancelled() || worker_cancel.is_cancelled() {
            break;
        }

        {
            let current_max = task.read().await.options.max_concurrent_downloads;
            if index as u32 >= current_max {
                break;
            }
        }

        if task.read().await.status == TaskStatus::Cancelled {
            break;
        }

        if runtime.is_paused() {
            if !sleep_cancellable(&runtime.cancel, Duration::from_millis(500)).await {
                break;
            }
            continue;
        }

        let item_id = match select_item(index, &task, &runtime).await {
            Some(id) => id,
            None => break,
        };

        if !wait_for_admission(&task, &runtime).await {
            continue;
        }

        if item_was_manually_paused(&task, &item_id).await {
            continue;
        }

        let attempt_cancel = runtime.cancel.child_token();
        runtime.ownership.insert(item_id.clone(), attempt_cancel.clone());

        run_one_item(&task, &runtime, &ctx, &item_id, &attempt_cancel).await;

        runtime.ownership.remove(&item_id);

        let cooldown = if task.read().await.options.tdl_mode {
            rand::thread_rng().gen_range(0.1..0.3)
        } else {
            rand::thread_rng().gen_range(3.0..10.0)
        };
        if !sleep_cancellable(&runtime.cancel, Duration::from_secs_f64(cooldown)).await {
            break;
        }
    }

    runtime.worker_cancels.remove(&index);
}

async fn gate_startup(runtime: &TaskRuntime) {
    let mut guard = runtime.last_worker_start.lock().await;
    if let Some(last) = *guard {
        let elapsed = last.elapsed();
        if elapsed < STARTUP_GATE {
            tokio::time::sleep(STARTUP_GATE - elapsed).await;
        }
    }
    *guard = Some(Instant::now());
}

async fn select_item(index: usize, task: &Arc<RwLock<Task>>, runtime: &Arc<TaskRuntime>) -> Option<String> {
    let mut count = runtime.pick_counts.entry(index).or_insert(0);
    *count += 1;
    let force_fifo = *count % STARVATION_GUARD_EVERY == 0;
    drop(count);

    if force_fifo {
        if let Some(id) = try_pick_fifo_item(runtime, task).await {
            return Some(id);
        }
    }

    {
        let mut t = task.write().await;
        if let Some(id) = pick_priority_item(&mut t, &runtime.ownership) {
            return Some(id);
        }
    }
    match pick_fifo_item(runtime).await {
        Some(FifoPick::Item(id)) => finalize_fifo_pick(task, id).await,
        Some(FifoPick::Drain) | None => None,
    }
}

/// Non-blocking P3 dequeue used by the starvation guard: returns `None`
/// immediately (instead of waiting) when the FIFO channel has nothing ready,
/// so a forced P3 pick never stalls a worker that has P1/P2 work available.
async fn try_pick_fifo_item(runtime: &TaskRuntime, task: &Arc<RwLock<Task>>) -> Option<String> {
    loop {
        let mut rx = runtime.queue_rx.lock().await;
        match rx.try_recv() {
            Ok(QueueMessage::Item(id)) => {
                if runtime.ownership.contains_key(&id) {
                    continue;
                }
                drop(rx);
                if let Some(id) = finalize_fifo_pick(task, id).await {
                    return Some(id);
                }
                continue;
            }
            Ok(QueueMessage::Drain) | Err(_) => return None,
        }
    }
}

async fn finalize_fifo_pick(task: &Arc<RwLock<Task>>, id: String) -> Option<String> {
    let t = task.read().await;
    let already_done = t
        .download_queue
        .iter()
        .find(|i| i.id == id)
        .map(|i| matches!(i.status, DownloadStatus::Completed | DownloadStatus::Skipped | DownloadStatus::Downloading))
        .unwrap_or(true);
    if already_done {
        None
    } else {
        Some(id)
    }
}

async fn wait_for_admission(task: &Arc<RwLock<Task>>, runtime: &Arc<TaskRuntime>) -> bool {
    loop {
        let ceiling = runtime.adaptive.ceiling();
        if !should_wait_for_admission(runtime.owned_count(), ceiling) {
            return true;
        }
        let poll = if runtime.is_paused() { ADMISSION_PAUSED_POLL } else { ADMISSION_POLL };
        if !sleep_cancellable(&runtime.cancel, poll).await {
            return false;
        }
        if task.read().await.status == TaskStatus::Cancelled {
            return false;
        }
    }
}

async fn item_was_manually_paused(task: &Arc<RwLock<Task>>, item_id: &str) -> bool {
    task.read()
        .await
        .download_queue
        .iter()
        .find(|i| i.id == item_id)
        .map(|i| i.is_manually_paused)
        .unwrap_or(false)
}

async fn run_one_item(task: &Arc<RwLock<Task>>, runtime: &Arc<TaskRuntime>, ctx: &Arc<WorkerContext>, item_id: &str, cancel: &CancelToken) {
    let (chat_id, message_id, file_size, rel_path, enable_parallel, connections, tdl_mode, max_retries, base_retry_delay) = {
        let t = task.read().await;
        let item = match t.download_queue.iter().find(|i| i.id == item_id) {
            Some(i) => i,
            None => return,
        };
        (
            item.chat_id,
            item.message_id,
            item.file_size,
            item.file_path.clone().unwrap_or_default(),
            t.options.enable_parallel_chunk,
            t.options.parallel_chunk_connections,
            t.options.tdl_mode,
            t.options.max_download_retries,
            t.options.retry_delay,
        )
    };

    let message = match ctx.client.get_message_by_id(chat_id, message_id).await {
        Ok(Some(m)) => m,
        _ => {
            mark_failed(task, ctx, item_id, "cannot fetch message").await;
            return;
        }
    };

    mark_downloading(task, item_id).await;

    let temp_path = ctx.temp_dir.join(format!("{item_id}_{}", rel_path.replace('/', "_")));
    let final_path = ctx.export_root.join(&rel_path);

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(u64, u64)>();
    let last_progress = Arc::new(std::sync::Mutex::new(Instant::now()));

    let progress_consumer = {
        let task = task.clone();
        let ctx = ctx.clone();
        let item_id = item_id.to_string();
        let last_progress = last_progress.clone();
        tokio::spawn(async move {
            let mut last_sample: Option<(Instant, u64)> = None;
            while let Some((downloaded, total)) = progress_rx.recv().await {
                *last_progress.lock().unwrap() = Instant::now();
                let mut t = task.write().await;
                if let Some(item) = t.get_item_mut(&item_id) {
                    item.update_progress(downloaded, total);
                    let now = Instant::now();
                    if let Some((prev_instant, prev_bytes)) = last_sample {
                        let dt = now.duration_since(prev_instant).as_secs_f64();
                        if dt > 0.0 {
                            item.speed = (downloaded.saturating_sub(prev_bytes) as f64 / dt).max(0.0);
                        }
                    }
                    last_sample = Some((now, downloaded));
                }
                ctx.observer.on_task_changed(&t);
            }
        })
    };

    let watchdog = {
        let watchdog_cancel = cancel.clone();
        let last_progress = last_progress.clone();
        tokio::spawn(async move {
            loop {
                if !sleep_cancellable(&watchdog_cancel, STUCK_CHECK_INTERVAL).await {
                    break;
                }
                let stuck = last_progress.lock().unwrap().elapsed() >= STUCK_TIMEOUT;
                if stuck {
                    watchdog_cancel.cancel();
                    break;
                }
            }
        })
    };

    let outcome = retry::download_with_retry(
        max_retries,
        base_retry_delay,
        |_attempt| {
            let message = message.clone();
            let temp_path = temp_path.clone();
            let progress_tx = progress_tx.clone();
            async {
                // Races the transfer itself against `cancel` (not just the
                // backoff sleep between attempts), so the 600s stuck-timeout
                // watchdog and a manual pause_item both end an in-flight
                // attempt immediately rather than waiting for it to return.
                tokio::select! {
                    result = run_download_strategy(
                        ctx,
                        runtime,
                        &message,
                        &temp_path,
                        file_size,
                        enable_parallel,
                        connections,
                        tdl_mode,
                        cancel,
                        progress_tx,
                    ) => result,
                    _ = cancel.cancelled() => Err(EngineError::Cancelled),
                }
            }
        },
        |secs| {
            let _ = secs;
            let change = runtime.adaptive.on_flood_wait(ctx.client.as_ref());
            let task = task.clone();
            let runtime = runtime.clone();
            tokio::spawn(async move {
                demote_excess_downloading(&task, &runtime, change.new_ceiling).await;
            });
        },
        || {},
        cancel,
    )
    .await;

    watchdog.abort();
    drop(progress_tx);
    let _ = progress_consumer.await;

    match outcome.error {
        None => {
            runtime.adaptive.on_success(ctx.client.as_ref());
            match verify_and_finalize(&temp_path, &final_path, file_size).await {
                Ok(()) => complete_item(task, ctx, item_id, &final_path).await,
                Err(e) => mark_failed(task, ctx, item_id, &e.to_string()).await,
            }
        }
        Some(EngineError::Cancelled) => release_paused(task, item_id).await,
        Some(e) => mark_failed(task, ctx, item_id, &e.to_string()).await,
    }
}

/// `progress` carries `(downloaded, total)` samples out to the caller's
/// consumer task as they arrive, so `downloaded_size`/`progress`/`speed`
/// move during a transfer instead of jumping straight to 100% on completion
/// (spec §4.5 step 7).
#[allow(clippy::too_many_arguments)]
async fn run_download_strategy(
    ctx: &Arc<WorkerContext>,
    runtime: &Arc<TaskRuntime>,
    message: &crate::model::MessageInfo,
    temp_path: &std::path::Path,
    file_size: u64,
    enable_parallel: bool,
    connections: u32,
    tdl_mode: bool,
    cancel: &CancelToken,
    progress: mpsc::UnboundedSender<(u64, u64)>,
) -> Result<(), EngineError> {
    if tdl_mode {
        if let Some(batcher) = &ctx.tdl {
            let key = format!("{}", message.chat_id);
            let url = format!("tg://{}/{}", message.chat_id, message.id);
            let dir = temp_path.parent().map(|p| p.to_path_buf()).unwrap_or_default();
            return batcher.submit(key, url, dir).await;
        }
    }

    if enable_parallel && file_size >= chunked::MIN_PARALLEL_SIZE {
        let location = ctx.client.resolve_file_location(message).await?;
        let result = chunked::parallel_download(
            ctx.client.as_ref(),
            &location,
            temp_path,
            file_size,
            connections,
            runtime.global_chunk_sem.clone(),
            cancel,
            Some(progress),
        )
        .await;
        return if result.success {
            Ok(())
        } else {
            Err(result.error.unwrap_or_else(|| EngineError::classified(ErrorKind::Unknown, "chunked download failed")))
        };
    }

    let callback: Arc<dyn Fn(u64, u64) + Send + Sync> = Arc::new(move |downloaded: u64, total: u64| {
        let _ = progress.send((downloaded, total));
    });
    ctx.client.download_media(message, temp_path, callback).await.map(|_| ())
}

async fn verify_and_finalize(temp_path: &std::path::Path, final_path: &std::path::Path, expected_size: u64) -> Result<(), EngineError> {
    let metadata = tokio::fs::metadata(temp_path).await?;
    if expected_size > 0 && metadata.len() != expected_size {
        let _ = tokio::fs::remove_file(temp_path).await;
        return Err(EngineError::classified(
            ErrorKind::IntegrityError,
            format!("expected {expected_size} bytes, got {}", metadata.len()),
        ));
    }
    if let Some(parent) = final_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(temp_path, final_path).await?;
    Ok(())
}

/// Demotes `Downloading` items beyond the new ceiling to `Paused`, from the
/// tail of the item list (spec §4.4 shrink rule).
async fn demote_excess_downloading(task: &Arc<RwLock<Task>>, runtime: &Arc<TaskRuntime>, new_ceiling: u32) {
    let owned = runtime.owned_count() as u32;
    if owned <= new_ceiling {
        return;
    }
    let mut excess = (owned - new_ceiling) as usize;
    let mut t = task.write().await;
    for item in t.download_queue.iter_mut().rev() {
        if excess == 0 {
            break;
        }
        if item.status == DownloadStatus::Downloading {
            item.status = DownloadStatus::Paused;
            runtime.cancel_item(&item.id);
            excess -= 1;
        }
    }
}

async fn mark_downloading(task: &Arc<RwLock<Task>>, item_id: &str) {
    let mut t = task.write().await;
    if let Some(item) = t.get_item_mut(item_id) {
        item.status = DownloadStatus::Downloading;
    }
}

async fn complete_item(task: &Arc<RwLock<Task>>, ctx: &Arc<WorkerContext>, item_id: &str, final_path: &std::path::Path) {
    let mut t = task.write().await;
    let mut was_retry = false;
    if let Some(item) = t.get_item_mut(item_id) {
        was_retry = item.is_retry;
        item.status = DownloadStatus::Completed;
        item.progress = 100.0;
        item.speed = 0.0;
        item.file_path = Some(final_path.display().to_string());
        item.downloaded_size = item.file_size;
    }
    if was_retry {
        t.retry_downloads += 1;
    }
    t.recompute_stats();
    ctx.observer.on_task_changed(&t);
}

async fn mark_failed(task: &Arc<RwLock<Task>>, ctx: &Arc<WorkerContext>, item_id: &str, message: &str) {
    let mut t = task.write().await;
    let (chat_id, message_id, file_name) = {
        if let Some(item) = t.get_item_mut(item_id) {
            item.status = DownloadStatus::Failed;
            item.error = Some(message.to_string());
            (item.chat_id, item.message_id, item.file_name.clone())
        } else {
            return;
        }
    };
    t.failed_downloads.push(crate::model::FailureRecord {
        chat_id,
        message_id,
        file_name: Some(file_name),
        error_kind: "unknown".to_string(),
        error_message: message.to_string(),
        retry_count: 0,
        last_retry: chrono::Utc::now(),
        resolved: false,
    });
    ctx.observer.on_task_changed(&t);
}

async fn release_paused(task: &Arc<RwLock<Task>>, item_id: &str) {
    let mut t = task.write().await;
    if let Some(item) = t.get_item_mut(item_id) {
        if item.status == DownloadStatus::Downloading {
            item.status = DownloadStatus::Paused;
        }
    }
}

/// Worker-Manager: spawns the initial pool and reconciles it against
/// `max_concurrent_downloads` every 3 s, staggering replacements by 2 s
/// (spec §4.5 "Worker-Manager supervises the pool").
pub async fn supervise_pool(task: Arc<RwLock<Task>>, runtime: Arc<TaskRuntime>, ctx: Arc<WorkerContext>) {
    let mut spawned: HashMap<usize, ()> = HashMap::new();
    loop {
        if runtime.cancel.is_cancelled() {
            break;
        }
        let wanted = task.read().await.options.max_concurrent_downloads as usize;

        for idx in 0..wanted {
            if !spawned.contains_key(&idx) {
                spawned.insert(idx, ());
                let task = task.clone();
                let runtime = runtime.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    run_worker(idx, task, runtime, ctx).await;
                });
                if !sleep_cancellable(&runtime.cancel, RECONCILE_STAGGER).await {
                    break;
                }
            }
        }
        spawned.retain(|idx, _| *idx < wanted);

        if !sleep_cancellable(&runtime.cancel, RECONCILE_EVERY).await {
            break;
        }
    }
}

/// Re-enqueues one non-manually-paused `Paused` item per tick (spec §4.5
/// "background auto-resume sweeper").
pub async fn auto_resume_sweep(task: Arc<RwLock<Task>>, runtime: Arc<TaskRuntime>) {
    loop {
        if !sleep_cancellable(&runtime.cancel, AUTO_RESUME_EVERY).await {
            break;
        }
        let mut t = task.write().await;
        if let Some(item) = t
            .download_queue
            .iter_mut()
            .find(|i| i.status == DownloadStatus::Paused && !i.is_manually_paused)
        {
            item.status = DownloadStatus::Waiting;
            item.resume_timestamp = chrono::Utc::now().timestamp() as f64;
            let id = item.id.clone();
            drop(t);
            runtime.enqueue(id);
        }
    }
}

/// Watches a running task for exhaustion of its item pool and transitions
/// it to `Completed` (nothing outstanding) or `Paused` (only `Failed` items
/// remain) — spec §4.7 "on natural termination... Completed iff no items
/// remain in Waiting/Downloading/Paused/Failed, else Paused".
pub async fn completion_watcher(task: Arc<RwLock<Task>>, runtime: Arc<TaskRuntime>, observer: SharedObserver) {
    loop {
        if !sleep_cancellable(&runtime.cancel, COMPLETION_CHECK_EVERY).await {
            break;
        }
        let mut t = task.write().await;
        if t.status != TaskStatus::Running || runtime.owned_count() > 0 {
            continue;
        }
        let active = t
            .download_queue
            .iter()
            .any(|i| matches!(i.status, DownloadStatus::Waiting | DownloadStatus::Downloading | DownloadStatus::Paused));
        if active {
            continue;
        }
        let has_failed = t.download_queue.iter().any(|i| i.status == DownloadStatus::Failed);
        t.status = if has_failed { TaskStatus::Paused } else { TaskStatus::Completed };
        if t.status == TaskStatus::Completed {
            t.completed_at = Some(chrono::Utc::now());
        }
        observer.on_task_changed(&t);
        drop(t);
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExportOptions, MediaType};

    fn item(chat_id: i64, message_id: i64) -> DownloadItem {
        DownloadItem::new(chat_id, message_id, "f".into(), 10, MediaType::Document, "files/f".into())
    }

    fn new_task() -> Task {
        Task::new("id".into(), "name".into(), ExportOptions::default(), chrono::Utc::now())
    }

    #[test]
    fn p1_picks_latest_resume_timestamp_and_clears_it() {
        let mut task = new_task();
        let mut a = item(1, 1);
        a.resume_timestamp = 10.0;
        let mut b = item(1, 2);
        b.resume_timestamp = 20.0;
        task.download_queue = vec![a, b];
        let ownership = DashMap::new();

        let picked = pick_priority_item(&mut task, &ownership).unwrap();
        assert_eq!(picked, "1_2");
        assert_eq!(task.get_item(1, 2).unwrap().resume_timestamp, 0.0);
    }

    #[test]
    fn p1_skips_owned_items() {
        let mut task = new_task();
        let mut a = item(1, 1);
        a.resume_timestamp = 10.0;
        task.download_queue = vec![a];
        let ownership = DashMap::new();
        ownership.insert("1_1".to_string(), CancelToken::new());

        assert!(pick_priority_item(&mut task, &ownership).is_none());
    }

    #[test]
    fn p2_picks_retry_item_when_no_p1_candidate() {
        let mut task = new_task();
        let mut a = item(1, 1);
        a.is_retry = true;
        task.download_queue = vec![a];
        let ownership = DashMap::new();

        assert_eq!(pick_priority_item(&mut task, &ownership).unwrap(), "1_1");
    }

    #[test]
    fn admission_gate_blocks_at_ceiling() {
        assert!(should_wait_for_admission(3, 3));
        assert!(!should_wait_for_admission(2, 3));
    }

    #[tokio::test]
    async fn ownership_map_rejects_double_registration_semantics() {
        let runtime = TaskRuntime::new(5, 5);
        runtime.ownership.insert("a".to_string(), CancelToken::new());
        assert_eq!(runtime.owned_count(), 1);
        runtime.ownership.insert("a".to_string(), CancelToken::new());
        assert_eq!(runtime.owned_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_watcher_completes_when_queue_is_clean() {
        let mut t = new_task();
        t.status = TaskStatus::Running;
        let mut a = item(1, 1);
        a.status = DownloadStatus::Completed;
        t.download_queue = vec![a];
        let task = Arc::new(RwLock::new(t));
        let runtime = TaskRuntime::new(5, 5);

        let handle = tokio::spawn(completion_watcher(task.clone(), runtime.clone(), Arc::new(crate::notify::NullObserver)));
        tokio::time::advance(COMPLETION_CHECK_EVERY + Duration::from_millis(10)).await;
        handle.await.unwrap();

        assert_eq!(task.read().await.status, TaskStatus::Completed);
    }

    fn message(id: i64, chat_id: i64, file_ref: &str, size: u64) -> crate::model::MessageInfo {
        crate::model::MessageInfo {
            id,
            chat_id,
            date: chrono::Utc::now(),
            from_user_id: None,
            text: None,
            media: Some(crate::model::MediaDescriptor {
                media_type: MediaType::Document,
                file_size: size,
                original_name: Some("f.bin".into()),
                file_reference: file_ref.into(),
            }),
        }
    }

    #[tokio::test]
    async fn run_one_item_reports_progress_and_completes_single_stream_download() {
        use crate::mtproto::MockMtProtoClient;
        use crate::notify::NullObserver;

        let dir = tempfile::tempdir().unwrap();
        let export_root = dir.path().join("export");
        let temp_dir = dir.path().join("temp");
        tokio::fs::create_dir_all(&export_root).await.unwrap();
        tokio::fs::create_dir_all(&temp_dir).await.unwrap();

        let body = vec![7u8; 2048];
        let client: Arc<dyn MtProtoClient> =
            Arc::new(MockMtProtoClient::new(vec![]).with_history(1, vec![message(1, 1, "ref", 2048)]).with_file_body("ref", body));

        let mut t = new_task();
        let dl_item = item(1, 1);
        let item_id = dl_item.id.clone();
        t.download_queue.push(dl_item);
        let task = Arc::new(RwLock::new(t));
        let runtime = TaskRuntime::new(5, 5);
        let ctx = Arc::new(WorkerContext {
            client,
            observer: Arc::new(NullObserver),
            tdl: None,
            export_root,
            temp_dir,
        });

        run_one_item(&task, &runtime, &ctx, &item_id, &CancelToken::new()).await;

        let t = task.read().await;
        let completed = t.get_item(1, 1).unwrap();
        assert_eq!(completed.status, DownloadStatus::Completed);
        assert_eq!(completed.downloaded_size, completed.file_size);
        assert_eq!(completed.progress, 100.0);
    }

    #[tokio::test]
    async fn complete_item_increments_retry_downloads_only_for_retried_items() {
        use crate::notify::NullObserver;

        let mut t = new_task();
        let mut dl_item = item(1, 1);
        dl_item.is_retry = true;
        let item_id = dl_item.id.clone();
        t.download_queue.push(dl_item);
        let task = Arc::new(RwLock::new(t));
        let ctx = Arc::new(WorkerContext {
            client: Arc::new(crate::mtproto::MockMtProtoClient::new(vec![])),
            observer: Arc::new(NullObserver),
            tdl: None,
            export_root: PathBuf::new(),
            temp_dir: PathBuf::new(),
        });

        complete_item(&task, &ctx, &item_id, std::path::Path::new("/tmp/out")).await;
        assert_eq!(task.read().await.retry_downloads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_download_is_cancelled_after_stuck_timeout() {
        use crate::error::ErrorKind;

        struct NeverFinishes;
        #[async_trait::async_trait]
        impl MtProtoClient for NeverFinishes {
            async fn get_dialogs(&self) -> Result<Vec<crate::model::ChatInfo>, EngineError> {
                Ok(vec![])
            }
            async fn get_chat_history(&self, _chat_id: i64, _offset_id: i64, _reverse: bool) -> Result<Vec<crate::model::MessageInfo>, EngineError> {
                Ok(vec![])
            }
            async fn get_message_by_id(&self, chat_id: i64, message_id: i64) -> Result<Option<crate::model::MessageInfo>, EngineError> {
                Ok(Some(message(message_id, chat_id, "ref", 10)))
            }
            async fn download_media(
                &self,
                _message: &crate::model::MessageInfo,
                _destination_path: &std::path::Path,
                _progress: Arc<dyn Fn(u64, u64) + Send + Sync>,
            ) -> Result<std::path::PathBuf, EngineError> {
                std::future::pending::<()>().await;
                unreachable!()
            }
            async fn resolve_file_location(&self, message: &crate::model::MessageInfo) -> Result<crate::mtproto::FileLocation, EngineError> {
                Ok(crate::mtproto::FileLocation {
                    chat_id: message.chat_id,
                    message_id: message.id,
                    file_reference: "ref".into(),
                })
            }
            async fn invoke_get_file(&self, _location: &crate::mtproto::FileLocation, _offset: u64, _limit: u32) -> Result<crate::mtproto::RawFileChunk, EngineError> {
                Err(EngineError::classified(ErrorKind::Unknown, "unused"))
            }
            fn set_max_concurrent_transmissions(&self, _value: u32) {}
        }

        use crate::notify::NullObserver;

        let mut t = new_task();
        let dl_item = item(1, 1);
        let item_id = dl_item.id.clone();
        t.download_queue.push(dl_item);
        let task = Arc::new(RwLock::new(t));
        let runtime = TaskRuntime::new(5, 5);
        let ctx = Arc::new(WorkerContext {
            client: Arc::new(NeverFinishes),
            observer: Arc::new(NullObserver),
            tdl: None,
            export_root: PathBuf::new(),
            temp_dir: PathBuf::new(),
        });

        let handle = tokio::spawn({
            let task = task.clone();
            let runtime = runtime.clone();
            let ctx = ctx.clone();
            async move { run_one_item(&task, &runtime, &ctx, &item_id, &CancelToken::new()).await }
        });

        tokio::time::advance(STUCK_TIMEOUT + STUCK_CHECK_INTERVAL + Duration::from_secs(1)).await;
        handle.await.unwrap();

        let t = task.read().await;
        let after = t.get_item(1, 1).unwrap();
        assert_eq!(after.status, DownloadStatus::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_watcher_pauses_when_only_failures_remain() {
        let mut t = new_task();
        t.status = TaskStatus::Running;
        let mut a = item(1, 1);
        a.status = DownloadStatus::Failed;
        t.download_queue = vec![a];
        let task = Arc::new(RwLock::new(t));
        let runtime = TaskRuntime::new(5, 5);

        let handle = tokio::spawn(completion_watcher(task.clone(), runtime.clone(), Arc::new(crate::notify::NullObserver)));
        tokio::time::advance(COMPLETION_CHECK_EVERY + Duration::from_millis(10)).await;
        handle.await.unwrap();

        assert_eq!(task.read().await.status, TaskStatus::Paused);
    }
}
