use serde::{Deserialize, Serialize};

/// Lifecycle state of a single [`DownloadItem`] (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Waiting,
    Downloading,
    Paused,
    Completed,
    Failed,
    Skipped,
}

/// Media kind, mirroring `original_source/models.py::MediaType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Photo,
    Video,
    Audio,
    Voice,
    VideoNote,
    Document,
    Sticker,
    Animation,
}

impl MediaType {
    /// Directory name under a chat's export folder (spec §6 layout table).
    pub fn subdirectory(&self) -> &'static str {
        match self {
            MediaType::Photo => "photos",
            MediaType::Video => "video_files",
            MediaType::Voice => "voice_messages",
            MediaType::VideoNote => "round_video_messages",
            MediaType::Audio => "audio_files",
            MediaType::Document => "files",
            MediaType::Sticker => "stickers",
            MediaType::Animation => "gifs",
        }
    }
}

/// A single media object tied to one message — the unit of download work
/// (spec §3, glossary "Item").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadItem {
    pub id: String,
    pub message_id: i64,
    pub chat_id: i64,
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub downloaded_size: u64,
    #[serde(default = "default_waiting")]
    pub status: DownloadStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub media_type: MediaType,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub is_manually_paused: bool,
    #[serde(default)]
    pub resume_timestamp: f64,
    #[serde(default)]
    pub is_retry: bool,
}

fn default_waiting() -> DownloadStatus {
    DownloadStatus::Waiting
}

impl DownloadItem {
    pub fn new(
        chat_id: i64,
        message_id: i64,
        file_name: String,
        file_size: u64,
        media_type: MediaType,
        file_path: String,
    ) -> Self {
        Self {
            id: super::item_id(chat_id, message_id),
            message_id,
            chat_id,
            file_name,
            file_size,
            downloaded_size: 0,
            status: DownloadStatus::Waiting,
            error: None,
            media_type,
            file_path: Some(file_path),
            progress: 0.0,
            speed: 0.0,
            is_manually_paused: false,
            resume_timestamp: 0.0,
            is_retry: false,
        }
    }

    /// Resets progress counters, as done by `retry_item`/`resume_item` (spec
    /// §4.7) for a previously-failed item.
    pub fn reset_progress(&mut self) {
        self.downloaded_size = 0;
        self.progress = 0.0;
        self.speed = 0.0;
        self.error = None;
    }

    pub fn update_progress(&mut self, downloaded: u64, total: u64) {
        self.downloaded_size = downloaded;
        self.progress = if total > 0 {
            (downloaded as f64 / total as f64) * 100.0
        } else {
            0.0
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_format() {
        let item = DownloadItem::new(-100, 42, "a.jpg".into(), 100, MediaType::Photo, "photos/a.jpg".into());
        assert_eq!(item.id, "-100_42");
    }

    #[test]
    fn reset_progress_clears_counters() {
        let mut item = DownloadItem::new(1, 1, "a".into(), 100, MediaType::Document, "f".into());
        item.update_progress(50, 100);
        item.error = Some("boom".into());
        item.reset_progress();
        assert_eq!(item.downloaded_size, 0);
        assert_eq!(item.progress, 0.0);
        assert!(item.error.is_none());
    }

    #[test]
    fn progress_percent_guards_zero_total() {
        let mut item = DownloadItem::new(1, 1, "a".into(), 0, MediaType::Document, "f".into());
        item.update_progress(0, 0);
        assert_eq!(item.progress, 0.0);
    }
}
