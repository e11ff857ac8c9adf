use std::sync::Arc;

use engine::task_manager::EngineState;
use jsonwebtoken::DecodingKey;

use crate::progress::WsObserver;
use crate::rate_limit::ApiLimiter;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<EngineState>,
    pub progress: Arc<WsObserver>,
    pub decoding_key: Arc<DecodingKey>,
    pub limiter: Arc<ApiLimiter>,
}
