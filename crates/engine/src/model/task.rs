use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{DownloadItem, DownloadStatus, ExportOptions, FailureRecord};

/// Task lifecycle state (spec §3). Exactly one of these holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Extracting,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Html,
    Json,
    Both,
}

impl Default for ExportFormat {
    fn default() -> Self {
        ExportFormat::Both
    }
}

/// An export task: identity, lifecycle state, options, progress, and the
/// persistent pool of [`DownloadItem`]s (spec §3 "Task").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: TaskStatus,
    pub options: ExportOptions,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Actual on-disk directory name, computed once at first scan.
    #[serde(default)]
    pub export_name: Option<String>,

    #[serde(default)]
    pub total_chats: u64,
    #[serde(default)]
    pub processed_chats: u64,
    #[serde(default)]
    pub total_messages: u64,
    #[serde(default)]
    pub processed_messages: u64,
    #[serde(default)]
    pub total_media: u64,
    #[serde(default)]
    pub downloaded_media: u64,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub downloaded_size: u64,

    #[serde(default)]
    pub current_scanning_chat: Option<String>,
    #[serde(default)]
    pub current_scanning_msg_id: i64,

    #[serde(default)]
    pub download_queue: Vec<DownloadItem>,

    /// Current adaptive concurrency ceiling; `None` until the worker pool
    /// has started at least once (spec §4.4).
    #[serde(default)]
    pub current_max_concurrent_downloads: Option<u32>,
    #[serde(default)]
    pub consecutive_success_count: u32,
    #[serde(default)]
    pub last_flood_wait_time: Option<chrono::DateTime<chrono::Utc>>,

    /// Per-chat last-scanned message id (spec §3 "Per-task runtime", §4.6).
    #[serde(default)]
    pub last_scanned_ids: HashMap<i64, i64>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub failed_downloads: Vec<FailureRecord>,
    #[serde(default)]
    pub retry_downloads: u32,
    #[serde(default)]
    pub download_speed: f64,

    #[serde(default)]
    pub is_verifying: bool,
    #[serde(default)]
    pub last_verify_result: Option<String>,

    #[serde(default)]
    pub proxy_enabled: bool,
    #[serde(default)]
    pub proxy_url: String,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

impl Task {
    pub fn new(id: String, name: String, options: ExportOptions, created_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            id,
            name,
            status: TaskStatus::Pending,
            options,
            created_at,
            started_at: None,
            completed_at: None,
            export_name: None,
            total_chats: 0,
            processed_chats: 0,
            total_messages: 0,
            processed_messages: 0,
            total_media: 0,
            downloaded_media: 0,
            total_size: 0,
            downloaded_size: 0,
            current_scanning_chat: None,
            current_scanning_msg_id: 0,
            download_queue: Vec::new(),
            current_max_concurrent_downloads: None,
            consecutive_success_count: 0,
            last_flood_wait_time: None,
            last_scanned_ids: HashMap::new(),
            error: None,
            failed_downloads: Vec::new(),
            retry_downloads: 0,
            download_speed: 0.0,
            is_verifying: false,
            last_verify_result: None,
            proxy_enabled: false,
            proxy_url: String::new(),
        }
    }

    /// Overall progress percentage, mirroring the original's computed
    /// `progress` property: scan-phase progress while `Extracting`,
    /// otherwise media-download progress.
    pub fn progress(&self) -> f64 {
        if self.status == TaskStatus::Extracting {
            if self.total_chats == 0 {
                return 0.0;
            }
            return (self.processed_chats as f64 / self.total_chats as f64) * 100.0;
        }
        if self.total_media == 0 {
            if self.total_messages == 0 {
                return 0.0;
            }
            return (self.processed_messages as f64 / self.total_messages as f64) * 100.0;
        }
        (self.downloaded_media as f64 / self.total_media as f64) * 100.0
    }

    pub fn get_item(&self, chat_id: i64, message_id: i64) -> Option<&DownloadItem> {
        let id = super::item_id(chat_id, message_id);
        self.download_queue.iter().find(|it| it.id == id)
    }

    pub fn get_item_mut(&mut self, item_id: &str) -> Option<&mut DownloadItem> {
        self.download_queue.iter_mut().find(|it| it.id == item_id)
    }

    /// Recomputes `downloaded_media`/`downloaded_size`/`total_media`/
    /// `total_size` from the item pool (spec §4.7 `_update_task_stats`,
    /// §8 "Sum property").
    pub fn recompute_stats(&mut self) {
        let mut completed = 0u64;
        let mut completed_size = 0u64;
        let mut total = 0u64;
        let mut total_size = 0u64;
        for item in &self.download_queue {
            total += 1;
            total_size += item.file_size;
            if matches!(item.status, DownloadStatus::Completed | DownloadStatus::Skipped) {
                completed += 1;
                completed_size += item.file_size;
            }
        }
        self.downloaded_media = completed;
        self.downloaded_size = completed_size;
        self.total_media = total;
        self.total_size = total_size;
    }

    /// Sanitised export directory name: `{sanitised_name}_{first 5 chars of id}` (spec §6).
    pub fn export_directory_name(&self) -> String {
        if let Some(name) = &self.export_name {
            return name.clone();
        }
        let sanitised = crate::scanner::sanitise_component(&self.name);
        let suffix: String = self.id.chars().take(5).collect();
        format!("{sanitised}_{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MediaType};

    fn opts() -> ExportOptions {
        ExportOptions::default()
    }

    #[test]
    fn progress_during_extracting_uses_chats() {
        let mut t = Task::new("id".into(), "n".into(), opts(), chrono::Utc::now());
        t.status = TaskStatus::Extracting;
        t.total_chats = 4;
        t.processed_chats = 1;
        assert_eq!(t.progress(), 25.0);
    }

    #[test]
    fn progress_falls_back_to_messages_when_no_media() {
        let mut t = Task::new("id".into(), "n".into(), opts(), chrono::Utc::now());
        t.total_messages = 10;
        t.processed_messages = 5;
        assert_eq!(t.progress(), 50.0);
    }

    #[test]
    fn progress_uses_media_counts_otherwise() {
        let mut t = Task::new("id".into(), "n".into(), opts(), chrono::Utc::now());
        t.total_media = 4;
        t.downloaded_media = 1;
        assert_eq!(t.progress(), 25.0);
    }

    #[test]
    fn recompute_stats_matches_sum_property() {
        let mut t = Task::new("id".into(), "n".into(), opts(), chrono::Utc::now());
        let mut a = DownloadItem::new(1, 1, "a".into(), 10, MediaType::Photo, "a".into());
        a.status = DownloadStatus::Completed;
        let mut b = DownloadItem::new(1, 2, "b".into(), 20, MediaType::Photo, "b".into());
        b.status = DownloadStatus::Skipped;
        let c = DownloadItem::new(1, 3, "c".into(), 30, MediaType::Photo, "c".into());
        t.download_queue = vec![a, b, c];
        t.recompute_stats();
        assert_eq!(t.downloaded_media, 2);
        assert_eq!(t.downloaded_size, 30);
        assert_eq!(t.total_media, 3);
        assert_eq!(t.total_size, 60);
    }
}
