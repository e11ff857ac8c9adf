use serde::{Deserialize, Serialize};

/// Diagnostic record accumulated on the task for a terminally- or
/// currently-failed item (spec §3 "Failure record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub chat_id: i64,
    pub message_id: i64,
    pub file_name: Option<String>,
    pub error_kind: String,
    pub error_message: String,
    pub retry_count: u32,
    pub last_retry: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub resolved: bool,
}
