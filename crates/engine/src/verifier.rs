//! Integrity Verifier (spec §4.7.1): reconciles the persistent item pool
//! against what's actually on disk. Runs off-queue, only while a task is
//! not `Running`.

use std::path::Path;

use regex_lite_filename::parse_export_file_name;
use serde::Serialize;

use crate::model::{DownloadStatus, Task};
use crate::mtproto::MtProtoClient;
use crate::notify::SharedObserver;

/// Counts placed on the task for display after a run (spec §4.7.1 "Results").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyResult {
    pub recovered: u32,
    pub fixed: u32,
    pub moved: u32,
}

impl VerifyResult {
    pub fn summary(&self) -> String {
        format!("recovered={} fixed={} moved={}", self.recovered, self.fixed, self.moved)
    }
}

/// Phase 2/3 of the verifier: walks `export_root`, matches files against
/// the `{message_id}-{|chat_id|}-{tail}` convention, and reconciles item
/// state against disk reality (spec §4.7.1 steps 2-3).
///
/// Phase 1 (force-full rescan of every selected chat) is the caller's
/// responsibility via [`crate::scanner::scan_chat`] with `force_full=true`,
/// since it needs the `MtProtoClient` the verifier itself is agnostic to.
pub async fn reconcile_with_disk(task: &mut Task, export_root: &Path, temp_dir: &Path) -> std::io::Result<VerifyResult> {
    let mut result = VerifyResult::default();

    let mut entries = match tokio::fs::read_dir(export_root).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(result),
        Err(e) => return Err(e),
    };

    let mut disk_files = Vec::new();
    collect_files_recursive(&mut entries, &mut disk_files).await?;

    for path in &disk_files {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        let Some(parsed) = parse_export_file_name(file_name) else { continue };

        let candidate = find_matching_item(task, parsed.message_id, parsed.abs_chat_id);
        let Some(item_id) = candidate else { continue };

        let disk_size = tokio::fs::metadata(path).await?.len();
        let expected = task.get_item_mut(&item_id).map(|i| i.file_size).unwrap_or(0);

        if expected == 0 || disk_size == expected {
            let rel = path.strip_prefix(export_root).unwrap_or(path).display().to_string();
            if let Some(item) = task.get_item_mut(&item_id) {
                if item.status != DownloadStatus::Completed {
                    result.recovered += 1;
                }
                item.status = DownloadStatus::Completed;
                item.file_path = Some(rel);
                item.downloaded_size = item.file_size;
                item.progress = 100.0;
            }
        } else {
            let moved_to = temp_dir.join(format!("{item_id}_{file_name}"));
            if let Some(parent) = moved_to.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(path, &moved_to).await?;
            if let Some(item) = task.get_item_mut(&item_id) {
                item.status = DownloadStatus::Waiting;
                item.reset_progress();
            }
            result.moved += 1;
        }
    }

    for item in task.download_queue.iter_mut() {
        let Some(rel) = &item.file_path else { continue };
        let full = export_root.join(rel);
        let exists_with_size = tokio::fs::metadata(&full)
            .await
            .map(|m| item.file_size == 0 || m.len() == item.file_size)
            .unwrap_or(false);

        if item.status == DownloadStatus::Completed && !exists_with_size {
            item.status = DownloadStatus::Waiting;
            result.fixed += 1;
        } else if item.status == DownloadStatus::Waiting && exists_with_size {
            item.status = DownloadStatus::Completed;
            result.fixed += 1;
        }
    }

    task.recompute_stats();
    Ok(result)
}

fn find_matching_item(task: &Task, message_id: i64, abs_chat_id: i64) -> Option<String> {
    task.download_queue
        .iter()
        .find(|i| i.message_id == message_id && i.chat_id.unsigned_abs() == abs_chat_id as u64)
        .map(|i| i.id.clone())
}

fn collect_files_recursive<'a>(
    entries: &'a mut tokio::fs::ReadDir,
    out: &'a mut Vec<std::path::PathBuf>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + 'a>> {
    Box::pin(async move {
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                let mut sub = tokio::fs::read_dir(&path).await?;
                collect_files_recursive(&mut sub, out).await?;
            } else {
                out.push(path);
            }
        }
        Ok(())
    })
}

/// Runs the full verifier: force-full rescan of every admitted chat, then
/// disk reconciliation. The task must already be `Paused` by the caller
/// (spec §4.7 `verify_integrity`: "task must not be Running").
pub async fn run_verifier(
    client: &dyn MtProtoClient,
    task: &mut Task,
    export_root: &Path,
    temp_dir: &Path,
    observer: &SharedObserver,
    cancel: &crate::cancel::CancelToken,
) -> Result<VerifyResult, crate::error::EngineError> {
    task.is_verifying = true;
    for chat_id in task.last_scanned_ids.keys().cloned().collect::<Vec<_>>() {
        task.last_scanned_ids.insert(chat_id, 0);
        crate::scanner::scan_chat(client, task, chat_id, true, observer, cancel).await?;
    }

    let result = reconcile_with_disk(task, export_root, temp_dir).await?;
    task.last_verify_result = Some(result.summary());
    task.is_verifying = false;
    Ok(result)
}

/// Parses the `"{message_id}-{|chat_id|}-{tail}"` export file-name
/// convention without pulling in a regex crate, since it's a single
/// fixed-arity split (spec §4.7.1 step 2).
mod regex_lite_filename {
    pub struct ParsedFileName {
        pub message_id: i64,
        pub abs_chat_id: i64,
    }

    pub fn parse_export_file_name(name: &str) -> Option<ParsedFileName> {
        let mut parts = name.splitn(3, '-');
        let message_id = parts.next()?.parse().ok()?;
        let abs_chat_id = parts.next()?.parse().ok()?;
        parts.next()?;
        Some(ParsedFileName { message_id, abs_chat_id })
    }
}
