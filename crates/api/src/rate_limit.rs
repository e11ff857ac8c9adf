//! Global request-rate cap (spec §6, a defensive ambient concern carried
//! from the workspace's dependency table rather than a named feature): a
//! single `governor` direct rate limiter shared across every route.

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::error::ApiError;
use crate::state::AppState;

pub type ApiLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub fn build_limiter(requests_per_second: u32) -> Arc<ApiLimiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second.max(1)).unwrap());
    Arc::new(RateLimiter::direct(quota))
}

pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, ApiError> {
    state.limiter.check().map_err(|_| ApiError::RateLimited)?;
    Ok(next.run(request).await)
}
