//! HTTP control plane: a thin `axum` adapter over [`engine::task_manager::EngineState`]'s
//! command surface, with bearer-JWT auth, a WebSocket progress feed, and a
//! global rate limiter (spec §6).
//!
//! This crate never runs the engine's background work itself — it only
//! issues commands against the `EngineState` it's handed and relays the
//! `TaskObserver` callbacks it's also handed into WebSocket frames.

pub mod auth;
pub mod bootstrap;
pub mod dto;
pub mod error;
pub mod handlers;
pub mod progress;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod ws;

pub use bootstrap::build_app;
pub use error::ApiError;
pub use progress::WsObserver;
pub use routes::router;
pub use state::AppState;
