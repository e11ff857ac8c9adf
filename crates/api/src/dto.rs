//! Request bodies the control plane accepts. Response bodies are just the
//! engine's own `Task`/`QueueView`/`VerifyResult` types — they're already
//! `Serialize`, so there's no separate response DTO layer to keep in sync.

use engine::model::ExportOptions;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    #[serde(default)]
    pub options: ExportOptions,
}

#[derive(Debug, Deserialize)]
pub struct ConcurrencyRequest {
    pub max_concurrent: Option<u32>,
    pub parallel_chunk: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    #[serde(default = "default_queue_limit")]
    pub limit: usize,
    #[serde(default)]
    pub reversed: bool,
}

fn default_queue_limit() -> usize {
    50
}

/// Query-string auth for the WebSocket upgrade route, since browsers can't
/// attach an `Authorization` header to a WS handshake.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: String,
}
