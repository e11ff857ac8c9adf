//! The MTProto client contract the core relies on (spec §6).
//!
//! The engine never talks to Telegram directly; it only knows this trait.
//! Production wiring (login, session handling, the real raw protocol) lives
//! outside this workspace. [`MockMtProtoClient`] is an in-memory test double
//! used by the engine's own test suite and by `crates/cli`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::EngineError;
use crate::model::{ChatInfo, MessageInfo};

/// An opaque location resolved from a message's media, passed to
/// `invoke_get_file` for raw chunked fetches (spec §4.3).
#[derive(Debug, Clone)]
pub struct FileLocation {
    pub chat_id: i64,
    pub message_id: i64,
    pub file_reference: String,
}

/// Bytes returned by a raw `upload.GetFile` call (spec §4.3, §6).
#[derive(Debug, Clone)]
pub struct RawFileChunk {
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait MtProtoClient: Send + Sync {
    async fn get_dialogs(&self) -> Result<Vec<ChatInfo>, EngineError>;

    /// Walks a chat's history starting at `offset_id`, oldest-first when
    /// `reverse` is true (spec §4.6).
    async fn get_chat_history(
        &self,
        chat_id: i64,
        offset_id: i64,
        reverse: bool,
    ) -> Result<Vec<MessageInfo>, EngineError>;

    async fn get_message_by_id(&self, chat_id: i64, message_id: i64) -> Result<Option<MessageInfo>, EngineError>;

    /// Single-stream download with a progress callback, used for media
    /// below the parallel-chunk threshold (spec §4.5 step 7, §6).
    async fn download_media(
        &self,
        message: &MessageInfo,
        destination_path: &std::path::Path,
        progress: Arc<dyn Fn(u64, u64) + Send + Sync>,
    ) -> Result<std::path::PathBuf, EngineError>;

    /// Resolves a message's media into a raw file location for chunked
    /// `GetFile` calls (spec §4.3 step 2).
    async fn resolve_file_location(&self, message: &MessageInfo) -> Result<FileLocation, EngineError>;

    /// Raw `upload.GetFile(location, offset, limit, precise)` (spec §4.3, §6).
    async fn invoke_get_file(&self, location: &FileLocation, offset: u64, limit: u32) -> Result<RawFileChunk, EngineError>;

    /// Mirrors the client's settable `max_concurrent_transmissions` (spec §4.4, §6).
    fn set_max_concurrent_transmissions(&self, value: u32);
}

/// Scripted failure injected at a specific call count, for adaptive-
/// concurrency and retry tests (spec §8 scenario 2).
#[derive(Debug, Clone)]
pub struct ScriptedFailure {
    pub after_calls: u32,
    pub kind: crate::error::ErrorKind,
    pub times: u32,
}

/// In-memory [`MtProtoClient`] double. Chat histories and message bodies are
/// registered up front; `invoke_get_file` serves bytes from a registered
/// buffer, 4096-byte aligned per spec §4.3.
pub struct MockMtProtoClient {
    dialogs: Vec<ChatInfo>,
    histories: DashMap<i64, Vec<MessageInfo>>,
    file_bodies: DashMap<String, Vec<u8>>,
    max_transmissions: AtomicU32,
    get_file_calls: AtomicU32,
    scripted_failures: DashMap<String, (u32, u32)>, // key -> (calls_remaining_until_trigger, times_remaining)
    scripts: Vec<ScriptedFailure>,
}

impl MockMtProtoClient {
    pub fn new(dialogs: Vec<ChatInfo>) -> Self {
        Self {
            dialogs,
            histories: DashMap::new(),
            file_bodies: DashMap::new(),
            max_transmissions: AtomicU32::new(0),
            get_file_calls: AtomicU32::new(0),
            scripted_failures: DashMap::new(),
            scripts: Vec::new(),
        }
    }

    pub fn with_history(self, chat_id: i64, messages: Vec<MessageInfo>) -> Self {
        self.histories.insert(chat_id, messages);
        self
    }

    pub fn with_file_body(self, file_reference: &str, body: Vec<u8>) -> Self {
        self.file_bodies.insert(file_reference.to_string(), body);
        self
    }

    /// Registers a scripted failure: the Nth call to `invoke_get_file`
    /// globally raises `kind` for `times` consecutive attempts, then
    /// succeeds (spec §8 scenario 2: "raises FloodWait(5) on the 4th
    /// concurrent call once").
    pub fn with_scripted_failure(mut self, failure: ScriptedFailure) -> Self {
        self.scripts.push(failure);
        self
    }

    pub fn get_file_call_count(&self) -> u32 {
        self.get_file_calls.load(Ordering::SeqCst)
    }

    pub fn max_transmissions(&self) -> u32 {
        self.max_transmissions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MtProtoClient for MockMtProtoClient {
    async fn get_dialogs(&self) -> Result<Vec<ChatInfo>, EngineError> {
        Ok(self.dialogs.clone())
    }

    async fn get_chat_history(
        &self,
        chat_id: i64,
        offset_id: i64,
        _reverse: bool,
    ) -> Result<Vec<MessageInfo>, EngineError> {
        let history = self.histories.get(&chat_id).map(|v| v.clone()).unwrap_or_default();
        Ok(history.into_iter().filter(|m| m.id > offset_id).collect())
    }

    async fn get_message_by_id(&self, chat_id: i64, message_id: i64) -> Result<Option<MessageInfo>, EngineError> {
        Ok(self
            .histories
            .get(&chat_id)
            .and_then(|v| v.iter().find(|m| m.id == message_id).cloned()))
    }

    async fn download_media(
        &self,
        message: &MessageInfo,
        destination_path: &std::path::Path,
        progress: Arc<dyn Fn(u64, u64) + Send + Sync>,
    ) -> Result<std::path::PathBuf, EngineError> {
        let media = message
            .media
            .as_ref()
            .ok_or_else(|| EngineError::classified(crate::error::ErrorKind::Unknown, "message has no media"))?;
        let body = self
            .file_bodies
            .get(&media.file_reference)
            .map(|v| v.clone())
            .unwrap_or_else(|| vec![0u8; media.file_size as usize]);
        if let Some(parent) = destination_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(destination_path, &body).await?;
        progress(body.len() as u64, media.file_size);
        Ok(destination_path.to_path_buf())
    }

    async fn resolve_file_location(&self, message: &MessageInfo) -> Result<FileLocation, EngineError> {
        let media = message
            .media
            .as_ref()
            .ok_or_else(|| EngineError::classified(crate::error::ErrorKind::Unknown, "message has no media"))?;
        Ok(FileLocation {
            chat_id: message.chat_id,
            message_id: message.id,
            file_reference: media.file_reference.clone(),
        })
    }

    async fn invoke_get_file(&self, location: &FileLocation, offset: u64, limit: u32) -> Result<RawFileChunk, EngineError> {
        let call_index = self.get_file_calls.fetch_add(1, Ordering::SeqCst) + 1;

        for script in &self.scripts {
            let mut entry = self
                .scripted_failures
                .entry(format!("{:?}", script.kind))
                .or_insert((0, script.times));
            if call_index == script.after_calls && entry.1 > 0 {
                entry.1 -= 1;
                return Err(EngineError::classified(script.kind.clone(), "scripted failure"));
            }
        }

        let body = self
            .file_bodies
            .get(&location.file_reference)
            .map(|v| v.clone())
            .unwrap_or_default();
        let start = offset as usize;
        let end = ((offset + limit as u64) as usize).min(body.len());
        let slice = if start < body.len() { body[start..end].to_vec() } else { Vec::new() };
        Ok(RawFileChunk { bytes: slice })
    }

    fn set_max_concurrent_transmissions(&self, value: u32) {
        self.max_transmissions.store(value, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatType, MediaDescriptor, MediaType};

    fn msg(id: i64, chat_id: i64, size: u64, file_ref: &str) -> MessageInfo {
        MessageInfo {
            id,
            chat_id,
            date: chrono::Utc::now(),
            from_user_id: None,
            text: None,
            media: Some(MediaDescriptor {
                media_type: MediaType::Document,
                file_size: size,
                original_name: Some("f.bin".into()),
                file_reference: file_ref.into(),
            }),
        }
    }

    #[tokio::test]
    async fn get_chat_history_filters_by_offset() {
        let client = MockMtProtoClient::new(vec![ChatInfo {
            id: 1,
            title: "t".into(),
            chat_type: ChatType::Channel,
            username: None,
            members_count: None,
        }])
        .with_history(1, vec![msg(1, 1, 10, "a"), msg(2, 1, 10, "b"), msg(3, 1, 10, "c")]);

        let history = client.get_chat_history(1, 1, true).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, 2);
    }

    #[tokio::test]
    async fn invoke_get_file_respects_offsets() {
        let client = MockMtProtoClient::new(vec![]).with_file_body("ref", vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let loc = FileLocation {
            chat_id: 1,
            message_id: 1,
            file_reference: "ref".into(),
        };
        let chunk = client.invoke_get_file(&loc, 4, 4).await.unwrap();
        assert_eq!(chunk.bytes, vec![5, 6, 7, 8]);
    }
}
