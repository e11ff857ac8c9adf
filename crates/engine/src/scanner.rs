//! Scanner (spec §4.6): walks a chat's message history, applies the task's
//! filters, and turns accepted media-bearing messages into [`DownloadItem`]s
//! on the task's persistent pool.

use std::time::Duration;

use rand::Rng;

use crate::cancel::CancelToken;
use crate::model::{ChatInfo, ChatType, DownloadItem, ExportOptions, FilterMode, MediaDescriptor, MessageInfo, Task, TaskStatus};
use crate::mtproto::MtProtoClient;
use crate::notify::SharedObserver;

/// Notify + resume-checkpoint cadence (spec §4.6 "every 50 messages").
const PROGRESS_EVERY: u64 = 50;

/// Strips everything but ASCII word characters, CJK ideographs, `.` and
/// `-` from a path component; emoji and other symbols are dropped (spec
/// §4.6, §6 file-name grammar).
pub fn sanitise_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| {
            c.is_ascii_alphanumeric()
                || *c == '_'
                || *c == '.'
                || *c == '-'
                || is_cjk(*c)
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c: char| c == '.' || c == '-');
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3040..=0x30FF | 0xAC00..=0xD7A3)
}

/// Deterministic file name: `"{message_id}-{|chat_id|}-{name-or-datetime}.{ext}"`
/// (spec §4.6).
pub fn build_file_name(message_id: i64, chat_id: i64, media: &MediaDescriptor, date: chrono::DateTime<chrono::Utc>) -> String {
    let ext = extension_for(media);
    let stem = match &media.original_name {
        Some(name) if !name.trim().is_empty() => {
            let without_ext = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
            sanitise_component(without_ext)
        }
        _ => date.format("%Y%m%d_%H%M%S").to_string(),
    };
    let chat_abs = chat_id.unsigned_abs();
    format!("{message_id}-{chat_abs}-{stem}.{ext}")
}

fn extension_for(media: &MediaDescriptor) -> &'static str {
    use crate::model::MediaType::*;
    match media.media_type {
        Photo => "jpg",
        Video => "mp4",
        VideoNote => "mp4",
        Voice => "ogg",
        Audio => "mp3",
        Document => "bin",
        Sticker => "webp",
        Animation => "gif",
    }
}

/// Whether a chat is admitted under the task's chat-type filters (spec §4.6,
/// `ExportOptions` chat-type toggles).
pub fn chat_type_admitted(options: &ExportOptions, chat: &ChatInfo) -> bool {
    if !options.specific_chats.is_empty() {
        return options.specific_chats.contains(&chat.id);
    }
    match chat.chat_type {
        ChatType::Private => options.private_chats,
        ChatType::Bot => options.bot_chats,
        ChatType::Group => options.private_groups,
        ChatType::Supergroup => options.public_groups,
        ChatType::Channel => {
            if chat.username.is_some() {
                options.public_channels
            } else {
                options.private_channels
            }
        }
    }
}

/// Whether a message passes the id/date/skip-specify/media-kind filters
/// (spec §4.6 "Filtering").
pub fn message_admitted(options: &ExportOptions, message: &MessageInfo) -> bool {
    if message.id < options.message_from {
        return false;
    }
    if options.message_to != 0 && message.id > options.message_to {
        return false;
    }
    if let Some(from) = options.date_from {
        if message.date < from {
            return false;
        }
    }
    if let Some(to) = options.date_to {
        if message.date > to {
            return false;
        }
    }
    match options.filter_mode {
        FilterMode::None => {}
        FilterMode::Skip => {
            if options.filter_messages.contains(&message.id) {
                return false;
            }
        }
        FilterMode::Specify => {
            if !options.filter_messages.contains(&message.id) {
                return false;
            }
        }
    }
    let Some(media) = &message.media else { return false };
    use crate::model::MediaType::*;
    match media.media_type {
        Photo => options.photos,
        Video => options.videos,
        Voice => options.voice_messages,
        VideoNote => options.video_messages,
        Sticker => options.stickers,
        Animation => options.gifs,
        Audio | Document => options.files,
    }
}

/// Result of scanning one chat: how many messages were walked and the
/// highest message id observed, to fold into `last_scanned_ids` (spec §4.6).
pub struct ScanOutcome {
    pub messages_seen: u64,
    pub highest_id: i64,
    pub items_enqueued: u64,
}

/// Scans one chat's history and enqueues accepted items onto the task
/// (spec §4.6). `force_full` resets the incremental checkpoint to the
/// beginning, as the verifier does.
pub async fn scan_chat(
    client: &dyn MtProtoClient,
    task: &mut Task,
    chat_id: i64,
    force_full: bool,
    observer: &SharedObserver,
    cancel: &CancelToken,
) -> Result<ScanOutcome, crate::error::EngineError> {
    let start_offset = if force_full || !task.options.incremental_scan_enabled {
        0
    } else {
        *task.last_scanned_ids.get(&chat_id).unwrap_or(&0)
    };

    let messages = client.get_chat_history(chat_id, start_offset, true).await?;

    let mut highest = start_offset;
    let mut enqueued = 0u64;
    let mut seen = 0u64;

    for message in &messages {
        if cancel.is_cancelled() {
            break;
        }
        seen += 1;
        highest = highest.max(message.id);
        task.current_scanning_msg_id = message.id;

        if message_admitted(&task.options, message) {
            if let Some(media) = &message.media {
                let id = crate::model::item_id(chat_id, message.id);
                if task.get_item(chat_id, message.id).is_none() {
                    let file_name = build_file_name(message.id, chat_id, media, message.date);
                    let rel_path = format!("{}/{}", media.media_type.subdirectory(), file_name);
                    let item = DownloadItem::new(chat_id, message.id, file_name, media.file_size, media.media_type, rel_path);
                    debug_assert_eq!(item.id, id);
                    task.download_queue.push(item);
                    enqueued += 1;
                }
            }
        }

        if seen % PROGRESS_EVERY == 0 {
            task.processed_messages += seen;
            observer.on_task_changed(task);
            seen = 0;
        }

        let jitter: f64 = rand::thread_rng().gen_range(0.05..0.15);
        tokio::time::sleep(Duration::from_secs_f64(0.2 + jitter)).await;
    }

    task.processed_messages += seen;
    task.current_scanning_msg_id = 0;
    task.last_scanned_ids
        .entry(chat_id)
        .and_modify(|v| *v = (*v).max(highest))
        .or_insert(highest);

    Ok(ScanOutcome {
        messages_seen: messages.len() as u64,
        highest_id: highest,
        items_enqueued: enqueued,
    })
}

/// Full extraction scan over every admitted dialog (spec §4.7 `_run_export`
/// "Extracting" phase).
pub async fn scan_all_chats(
    client: &dyn MtProtoClient,
    task: &mut Task,
    observer: &SharedObserver,
    cancel: &CancelToken,
) -> Result<(), crate::error::EngineError> {
    task.status = TaskStatus::Extracting;
    let dialogs = client.get_dialogs().await?;
    let admitted: Vec<ChatInfo> = dialogs.into_iter().filter(|c| chat_type_admitted(&task.options, c)).collect();

    task.total_chats = admitted.len() as u64;
    task.processed_chats = 0;

    for chat in admitted {
        if cancel.is_cancelled() {
            break;
        }
        task.current_scanning_chat = Some(chat.title.clone());
        scan_chat(client, task, chat.id, false, observer, cancel).await?;
        task.current_scanning_chat = None;
        task.processed_chats += 1;
        observer.on_task_changed(task);
    }

    Ok(())
}
