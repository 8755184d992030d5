//! WebSocket handler for real-time progress updates

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::AppState;

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Forward engine events to one connected client.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.manager.subscribe();

    info!("WebSocket client connected");

    // Spawn task to forward engine events to the client
    let send_task = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                // A slow client only loses its oldest backlog; newer events
                // keep flowing.
                Err(RecvError::Lagged(skipped)) => {
                    warn!("WebSocket subscriber lagged, skipped {skipped} events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let msg = match serde_json::to_string(&event) {
                Ok(msg) => msg,
                Err(_) => continue,
            };
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Drain the client side until it goes away
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) => {
                info!("WebSocket client disconnected");
                break;
            }
            Err(e) => {
                error!("WebSocket error: {e}");
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
}
