//! Route table (spec §6 "Control plane"). One router per concern, merged
//! under `with_state` so every extractor sees the same [`AppState`].

use axum::middleware;
use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::rate_limit;
use crate::state::AppState;
use crate::ws;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/tasks", post(handlers::create_task).get(handlers::list_tasks))
        .route("/tasks/:id", get(handlers::get_task))
        .route("/tasks/:id/start", post(handlers::start_task))
        .route("/tasks/:id/pause", post(handlers::pause_task))
        .route("/tasks/:id/resume", post(handlers::resume_task))
        .route("/tasks/:id/cancel", post(handlers::cancel_task))
        .route("/tasks/:id/retry-failed", post(handlers::retry_all_failed))
        .route("/tasks/:id/concurrency", patch(handlers::adjust_concurrency))
        .route("/tasks/:id/verify", post(handlers::verify_integrity))
        .route("/tasks/:id/queue", get(handlers::get_queue))
        .route("/tasks/:id/progress", get(ws::progress_ws))
        .route("/tasks/:id/items/:item_id/pause", post(handlers::pause_item))
        .route("/tasks/:id/items/:item_id/resume", post(handlers::resume_item))
        .route("/tasks/:id/items/:item_id/retry", post(handlers::retry_item))
        .route("/tasks/:id/items/:item_id/cancel", post(handlers::cancel_item))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit::rate_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
