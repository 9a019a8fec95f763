use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::http::AppState;

/// Upgrades to a WebSocket carrying the tenant's bridge stream. Each event is
/// one JSON text frame in the same shape the UI polls elsewhere.
pub async fn session_events(
    ws: WebSocketUpgrade,
    Path(tenant): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, tenant, state))
}

async fn stream_events(mut socket: WebSocket, tenant: String, state: AppState) {
    let mut rx = state.bridge.subscribe(&tenant);
    debug!(tenant, "event stream attached");
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(tenant, skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                // Clients only ever ping; anything else ends the stream.
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
    debug!(tenant, "event stream detached");
}
