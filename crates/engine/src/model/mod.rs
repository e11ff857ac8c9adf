//! Data model for the Export Task Engine (spec §3).

mod chat;
mod failure;
mod item;
mod options;
mod task;

pub use chat::{ChatInfo, ChatType, MediaDescriptor, MessageInfo};
pub use failure::FailureRecord;
pub use item::{DownloadItem, DownloadStatus, MediaType};
pub use options::{ExportOptions, FilterMode};
pub use task::{ExportFormat, Task, TaskStatus};

/// A task-scoped identifier: `"{chat_id}_{message_id}"`, used as
/// [`DownloadItem`]'s key throughout the engine (spec §3, §4.6).
pub fn item_id(chat_id: i64, message_id: i64) -> String {
    format!("{chat_id}_{message_id}")
}
