use serde::{Deserialize, Serialize};

/// Chat-type discriminant, mirroring `original_source/models.py::ChatType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Private,
    Bot,
    Group,
    Supergroup,
    Channel,
}

/// A dialog/chat as returned by `MtProtoClient::get_dialogs` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: i64,
    pub title: String,
    #[serde(rename = "type")]
    pub chat_type: ChatType,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub members_count: Option<u64>,
}

/// A single message as seen by the scanner, carrying just enough to decide
/// whether it is media-bearing and acceptable under the task's filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: i64,
    pub chat_id: i64,
    pub date: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub from_user_id: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<MediaDescriptor>,
}

/// Media payload of a message, sufficient for the scanner to build a
/// [`crate::model::DownloadItem`] and for the downloader to resolve a file
/// location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub media_type: super::MediaType,
    pub file_size: u64,
    /// Original file name as reported by Telegram, if any (before
    /// sanitisation — see `scanner::sanitise_file_name`).
    #[serde(default)]
    pub original_name: Option<String>,
    /// Opaque file reference token; used by raw `GetFile` calls and
    /// invalidated server-side (spec glossary "File reference").
    pub file_reference: String,
}
