//! Route handlers: one thin async fn per engine command, matching the
//! command surface `EngineState` exposes (spec §4.7, §6).

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::auth::AuthenticatedOperator;
use crate::dto::{ConcurrencyRequest, CreateTaskRequest, QueueQuery};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn create_task(State(state): State<AppState>, _op: AuthenticatedOperator, Json(body): Json<CreateTaskRequest>) -> Result<impl IntoResponse, ApiError> {
    let task = state.engine.create(body.name, body.options).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn list_tasks(State(state): State<AppState>, _op: AuthenticatedOperator) -> impl IntoResponse {
    Json(state.engine.list_snapshots().await)
}

pub async fn get_task(State(state): State<AppState>, _op: AuthenticatedOperator, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.snapshot(&id).await?))
}

pub async fn start_task(State(state): State<AppState>, _op: AuthenticatedOperator, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    state.engine.start(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn pause_task(State(state): State<AppState>, _op: AuthenticatedOperator, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    state.engine.pause(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn resume_task(State(state): State<AppState>, _op: AuthenticatedOperator, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    state.engine.resume(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn cancel_task(State(state): State<AppState>, _op: AuthenticatedOperator, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    state.engine.cancel(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pause_item(State(state): State<AppState>, _op: AuthenticatedOperator, Path((id, item_id)): Path<(String, String)>) -> Result<impl IntoResponse, ApiError> {
    state.engine.pause_item(&id, &item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn resume_item(State(state): State<AppState>, _op: AuthenticatedOperator, Path((id, item_id)): Path<(String, String)>) -> Result<impl IntoResponse, ApiError> {
    state.engine.resume_item(&id, &item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn retry_item(State(state): State<AppState>, _op: AuthenticatedOperator, Path((id, item_id)): Path<(String, String)>) -> Result<impl IntoResponse, ApiError> {
    state.engine.retry_item(&id, &item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cancel_item(State(state): State<AppState>, _op: AuthenticatedOperator, Path((id, item_id)): Path<(String, String)>) -> Result<impl IntoResponse, ApiError> {
    state.engine.cancel_item(&id, &item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn retry_all_failed(State(state): State<AppState>, _op: AuthenticatedOperator, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let retried = state.engine.retry_all_failed(&id).await?;
    Ok(Json(json!({ "retried": retried })))
}

pub async fn adjust_concurrency(
    State(state): State<AppState>,
    _op: AuthenticatedOperator,
    Path(id): Path<String>,
    Json(body): Json<ConcurrencyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.adjust_concurrency(&id, body.max_concurrent, body.parallel_chunk).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn verify_integrity(State(state): State<AppState>, _op: AuthenticatedOperator, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let result = state.engine.verify_integrity(&id).await?;
    Ok(Json(result))
}

pub async fn get_queue(
    State(state): State<AppState>,
    _op: AuthenticatedOperator,
    Path(id): Path<String>,
    Query(query): Query<QueueQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.engine.get_queue(&id, query.limit, query.reversed).await?;
    Ok(Json(view))
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
