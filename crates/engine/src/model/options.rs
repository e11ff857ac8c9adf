use serde::{Deserialize, Serialize};

/// Per-task options (spec §3 "Options"), expanded per `original_source`'s
/// `ExportOptions` for the chat-type filter and message-filter fields the
/// distilled spec left implicit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportOptions {
    // Chat-type filters
    #[serde(default = "default_true")]
    pub private_chats: bool,
    #[serde(default)]
    pub bot_chats: bool,
    #[serde(default = "default_true")]
    pub private_groups: bool,
    #[serde(default = "default_true")]
    pub private_channels: bool,
    #[serde(default)]
    pub public_groups: bool,
    #[serde(default)]
    pub public_channels: bool,
    #[serde(default)]
    pub only_my_messages: bool,
    #[serde(default)]
    pub specific_chats: Vec<i64>,

    // Message-id range; `message_to = 0` means "latest" (spec §3, §8).
    #[serde(default = "default_one")]
    pub message_from: i64,
    #[serde(default)]
    pub message_to: i64,

    // Date range
    #[serde(default)]
    pub date_from: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub date_to: Option<chrono::DateTime<chrono::Utc>>,

    // Message filter (skip/specify lists)
    #[serde(default)]
    pub filter_mode: FilterMode,
    #[serde(default)]
    pub filter_messages: Vec<i64>,

    // Media-kind toggles
    #[serde(default = "default_true")]
    pub photos: bool,
    #[serde(default = "default_true")]
    pub videos: bool,
    #[serde(default = "default_true")]
    pub voice_messages: bool,
    #[serde(default = "default_true")]
    pub video_messages: bool,
    #[serde(default)]
    pub stickers: bool,
    #[serde(default = "default_true")]
    pub gifs: bool,
    #[serde(default = "default_true")]
    pub files: bool,

    // Download settings
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: u32,
    #[serde(default = "default_parallel_connections")]
    pub parallel_chunk_connections: u32,
    #[serde(default)]
    pub enable_parallel_chunk: bool,
    #[serde(default = "default_max_retries")]
    pub max_download_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    #[serde(default = "default_true")]
    pub skip_existing: bool,
    #[serde(default = "default_true")]
    pub incremental_scan_enabled: bool,

    // External-downloader back-end selection (spec §4.5 step 7, §4.5.1)
    #[serde(default)]
    pub tdl_mode: bool,

    pub export_path: String,

    #[serde(default)]
    pub proxy: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    #[default]
    None,
    Skip,
    Specify,
}

fn default_true() -> bool {
    true
}
fn default_one() -> i64 {
    1
}
fn default_max_concurrent() -> u32 {
    10
}
fn default_parallel_connections() -> u32 {
    2
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_delay() -> f64 {
    2.0
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            private_chats: true,
            bot_chats: false,
            private_groups: true,
            private_channels: true,
            public_groups: false,
            public_channels: false,
            only_my_messages: false,
            specific_chats: Vec::new(),
            message_from: 1,
            message_to: 0,
            date_from: None,
            date_to: None,
            filter_mode: FilterMode::None,
            filter_messages: Vec::new(),
            photos: true,
            videos: true,
            voice_messages: true,
            video_messages: true,
            stickers: false,
            gifs: true,
            files: true,
            max_concurrent_downloads: default_max_concurrent(),
            parallel_chunk_connections: default_parallel_connections(),
            enable_parallel_chunk: false,
            max_download_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            skip_existing: true,
            incremental_scan_enabled: true,
            tdl_mode: false,
            export_path: "/downloads".to_string(),
            proxy: String::new(),
        }
    }
}

impl ExportOptions {
    /// Clamp ranges used by `adjust_concurrency` (spec §4.7): 1-20 for
    /// `max_concurrent_downloads`, 1-8 for `parallel_chunk_connections`.
    pub fn clamp_concurrency(&mut self) {
        self.max_concurrent_downloads = self.max_concurrent_downloads.clamp(1, 20);
        self.parallel_chunk_connections = self.parallel_chunk_connections.clamp(1, 8);
    }

    /// Migrates a legacy `download_threads` field into
    /// `parallel_chunk_connections`, clamped to `[1, 8]` (spec §6).
    pub fn migrate_download_threads(value: serde_json::Value) -> serde_json::Value {
        let mut value = value;
        if let Some(obj) = value.as_object_mut() {
            if obj.contains_key("download_threads") && !obj.contains_key("parallel_chunk_connections") {
                if let Some(threads) = obj.get("download_threads").and_then(|v| v.as_u64()) {
                    let clamped = threads.clamp(1, 8);
                    obj.insert(
                        "parallel_chunk_connections".to_string(),
                        serde_json::Value::from(clamped),
                    );
                }
            }
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_respects_bounds() {
        let mut o = ExportOptions {
            max_concurrent_downloads: 999,
            parallel_chunk_connections: 0,
            ..Default::default()
        };
        o.clamp_concurrency();
        assert_eq!(o.max_concurrent_downloads, 20);
        assert_eq!(o.parallel_chunk_connections, 1);
    }

    #[test]
    fn migrates_legacy_download_threads() {
        let raw = serde_json::json!({"download_threads": 12});
        let migrated = ExportOptions::migrate_download_threads(raw);
        assert_eq!(migrated["parallel_chunk_connections"], 8);
    }

    #[test]
    fn does_not_override_existing_parallel_connections() {
        let raw = serde_json::json!({"download_threads": 12, "parallel_chunk_connections": 3});
        let migrated = ExportOptions::migrate_download_threads(raw);
        assert_eq!(migrated["parallel_chunk_connections"], 3);
    }
}
