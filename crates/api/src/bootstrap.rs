//! Wires a fresh [`EngineState`] out of the concrete `storage`/`platform`
//! adapters and exposes it as a ready-to-serve `axum::Router`. This is the
//! glue a server binary calls; the route handlers themselves stay agnostic
//! of which `TaskStore`/`ExternalDownloader` back them.

use std::sync::Arc;

use engine::mtproto::MtProtoClient;
use engine::task_manager::EngineState;
use jsonwebtoken::DecodingKey;
use platform::EngineConfig;
use storage::JsonFileStore;

use crate::progress::WsObserver;
use crate::rate_limit::build_limiter;
use crate::routes::router;
use crate::state::AppState;

/// Requests per second the rate limiter admits globally (spec §6).
const DEFAULT_RATE_LIMIT: u32 = 50;

/// Builds the full control plane: a `JsonFileStore` under the config's data
/// directory, an optional `tdl` batcher if `config.tdl_enabled`, and the
/// `axum::Router` wired to all of it. `client` is supplied by the caller
/// since it's the one piece this crate can't construct generically (a real
/// MTProto session vs. a mock, depending on how the binary was invoked).
pub async fn build_app(config: &EngineConfig, client: Arc<dyn MtProtoClient>) -> Result<axum::Router, engine::EngineError> {
    let data_dir = config.resolved_data_dir();
    platform::layout::prepare_export_layout(&data_dir, &data_dir.join("temp")).await?;
    let store = JsonFileStore::new(data_dir.join("tasks.json"));

    let tdl = if config.tdl_enabled {
        let downloader = Arc::new(platform::ProcessExternalDownloader::new(config.tdl_path.clone()));
        Some(Arc::new(engine::tdl::TdlBatcher::new(downloader, 4, 2, config.proxy.clone())))
    } else {
        None
    };

    let progress = Arc::new(WsObserver::new());
    let state = Arc::new(EngineState::new(client, store.clone(), progress.clone(), tdl, data_dir));
    store.attach(&state);
    state.restore().await?;

    let secret = config.jwt_secret.clone().unwrap_or_else(|| "tg-export-dev-secret".to_string());
    let app_state = AppState {
        engine: state,
        progress,
        decoding_key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
        limiter: build_limiter(DEFAULT_RATE_LIMIT),
    };

    Ok(router(app_state))
}
