//! External-downloader batcher (spec §4.5.1): an optional back-end that
//! hands a batch of items per `(task, target directory)` to an
//! out-of-process downloader such as `tdl`, instead of using the raw
//! MTProto path.
//!
//! The engine only knows [`ExternalDownloader`]; the concrete process
//! adapter lives in `crates/platform`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};

use crate::error::{EngineError, ErrorKind};

/// Window a bucket stays open before it flushes (spec §4.5.1).
const FLUSH_DELAY: Duration = Duration::from_millis(300);

/// How often the disk sniffer polls the output directory for progress
/// (spec §4.5.1, §5 "Timeouts").
pub const SNIFFER_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub urls: Vec<String>,
    pub output_dir: PathBuf,
    pub threads: u32,
    pub connections_per_file: u32,
    pub proxy: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub success: bool,
    pub combined_output: String,
}

/// The out-of-process downloader contract (spec §6 "External downloader
/// contract"). The core treats stdout as diagnostic only; verification is
/// always disk-side.
#[async_trait]
pub trait ExternalDownloader: Send + Sync {
    async fn run(&self, request: DownloadRequest) -> Result<DownloadOutcome, EngineError>;
}

/// One submission into a batch: the item's file URL and the sender that
/// resolves once the whole bucket's invocation finishes.
struct PendingEntry {
    url: String,
    reply: oneshot::Sender<Result<(), EngineError>>,
}

struct Bucket {
    entries: Vec<PendingEntry>,
    output_dir: PathBuf,
}

/// Batches concurrent submissions keyed by `(task_id, target_sub_directory)`
/// so a burst of worker submissions becomes one external invocation (spec
/// §4.5.1).
pub struct TdlBatcher {
    downloader: Arc<dyn ExternalDownloader>,
    threads: u32,
    connections_per_file: u32,
    proxy: Option<String>,
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

impl TdlBatcher {
    pub fn new(downloader: Arc<dyn ExternalDownloader>, threads: u32, connections_per_file: u32, proxy: Option<String>) -> Self {
        Self {
            downloader,
            threads,
            connections_per_file,
            proxy,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submits one item's URL into the bucket for `key`, scheduling a flush
    /// on the first submission into a fresh bucket. Awaits the bucket's
    /// shared outcome.
    pub async fn submit(&self, key: String, url: String, output_dir: PathBuf) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        let is_new = {
            let mut buckets = self.buckets.lock().await;
            let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
                entries: Vec::new(),
                output_dir: output_dir.clone(),
            });
            let was_empty = bucket.entries.is_empty();
            bucket.entries.push(PendingEntry { url, reply: tx });
            was_empty
        };

        if is_new {
            let buckets = self.buckets.clone();
            let downloader = self.downloader.clone();
            let threads = self.threads;
            let connections_per_file = self.connections_per_file;
            let proxy = self.proxy.clone();
            tokio::spawn(async move {
                tokio::time::sleep(FLUSH_DELAY).await;
                flush_bucket(buckets, key, downloader, threads, connections_per_file, proxy).await;
            });
        }

        rx.await.map_err(|_| EngineError::classified(ErrorKind::Unknown, "batcher dropped reply"))?
    }
}

async fn flush_bucket(
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
    key: String,
    downloader: Arc<dyn ExternalDownloader>,
    threads: u32,
    connections_per_file: u32,
    proxy: Option<String>,
) {
    let bucket = {
        let mut buckets = buckets.lock().await;
        buckets.remove(&key)
    };
    let Some(bucket) = bucket else { return };

    let urls: Vec<String> = bucket.entries.iter().map(|e| e.url.clone()).collect();
    let request = DownloadRequest {
        urls,
        output_dir: bucket.output_dir,
        threads,
        connections_per_file,
        proxy,
    };

    let outcome = downloader.run(request).await;

    // Any exception in the batched call releases every future in the
    // bucket with a failure result — never leave a worker awaiting forever.
    let result: Result<(), EngineError> = match outcome {
        Ok(o) if o.success => Ok(()),
        Ok(o) => Err(EngineError::classified(ErrorKind::Unknown, o.combined_output)),
        Err(e) => Err(e),
    };

    for entry in bucket.entries {
        let _ = entry.reply.send(clone_result(&result));
    }
}

fn clone_result(result: &Result<(), EngineError>) -> Result<(), EngineError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => Err(EngineError::classified(
            e.kind().cloned().unwrap_or(ErrorKind::Unknown),
            e.to_string(),
        )),
    }
}

/// Matches a sniffed file name against the `"{message_id}-{|chat_id|}-"`
/// convention (spec §4.5.1 "disk sniffer", §9 "includes `|chat_id|` in the
/// prefix match"), returning the parsed `(message_id, abs_chat_id)`.
/// `abs_chat_id` disambiguates collisions when several chats share an
/// output sub-directory, matching `verifier.rs`'s own file-name parsing.
pub fn match_sniffed_file(file_name: &str) -> Option<(i64, i64)> {
    let mut parts = file_name.splitn(3, '-');
    let message_id = parts.next()?.parse().ok()?;
    let abs_chat_id = parts.next()?.parse().ok()?;
    parts.next()?;
    Some((message_id, abs_chat_id))
}

/// Polls `output_dir` every [`SNIFFER_INTERVAL`] for files produced by the
/// external downloader, matching each one back to an in-flight
/// `Downloading` item and updating its byte counters so the UI shows
/// movement while the batched external process is still running (spec
/// §4.5.1 "disk sniffer").
///
/// Chat ids in the task model can be negative (groups/channels) while the
/// file-name prefix always stores the absolute value, so a match tries both
/// signs, mirroring `verifier::find_matching_item`'s resolution of the same
/// ambiguity.
pub async fn run_disk_sniffer(
    output_dir: std::path::PathBuf,
    task: std::sync::Arc<tokio::sync::RwLock<crate::model::Task>>,
    observer: crate::notify::SharedObserver,
    cancel: crate::cancel::CancelToken,
) {
    loop {
        if !crate::cancel::sleep_cancellable(&cancel, SNIFFER_INTERVAL).await {
            break;
        }

        let mut entries = match tokio::fs::read_dir(&output_dir).await {
            Ok(e) => e,
            Err(_) => continue,
        };

        let mut t = task.write().await;
        let mut changed = false;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(e)) => e,
                _ => break,
            };
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else { continue };
            let Some((message_id, abs_chat_id)) = match_sniffed_file(&file_name) else { continue };
            let Some(item) = t.download_queue.iter_mut().find(|i| {
                i.message_id == message_id && i.chat_id.unsigned_abs() == abs_chat_id as u64 && i.status == crate::model::DownloadStatus::Downloading
            }) else {
                continue;
            };

            let size = match tokio::fs::metadata(entry.path()).await {
                Ok(m) => m.len(),
                Err(_) => continue,
            };
            item.update_progress(size, item.file_size);
            changed = true;
        }

        if changed {
            observer.on_task_changed(&t);
        }
    }
}
