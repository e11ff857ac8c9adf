//! Progress push over a WebSocket (spec §6): one connection per task,
//! forwarding every [`WsObserver`] update until either side closes.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use tokio::sync::broadcast;

use crate::auth::decode_token;
use crate::dto::WsAuthQuery;
use crate::error::ApiError;
use crate::state::AppState;

pub async fn progress_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(auth): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    decode_token(&auth.token, &state.decoding_key)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, id)))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, task_id: String) {
    let mut updates = state.progress.subscribe(&task_id);
    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(task) => {
                        let Ok(payload) = serde_json::to_string(&task) else { continue };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    // A lagging receiver just drops the oldest snapshots;
                    // the next one it gets is still the current state.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                if incoming.is_none() {
                    break;
                }
            }
        }
    }
}
