//! WebSocket push channel for live clients.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use relay_core::RelayMessage;

use crate::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_INVALID_FRAMES, WS_MESSAGES_SENT,
};
use crate::state::AppState;

/// Frames a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    /// Answered with a `pong` carrying the current stats.
    Ping,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a single WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let service = state.service().clone();

    let (id, mut rx) = service.subscribe();
    service.send_to(
        id,
        RelayMessage::Status {
            data: service.stats(),
        },
    );

    WS_CONNECTIONS_TOTAL.inc();
    WS_CONNECTIONS_ACTIVE.inc();
    info!("WebSocket client {} connected", id);

    // Forward relay events to this client
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            WS_MESSAGES_SENT.with_label_values(&[msg.kind()]).inc();

            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        debug!("WebSocket send failed, client disconnected");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize RelayMessage: {}", e);
                }
            }
        }
        debug!("Event stream for client {} ended", id);
    });

    // Handle frames from the client (ping, close)
    let pong_service = service.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => {
                    debug!("WebSocket client requested close");
                    break;
                }
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Ping) => {
                        pong_service.send_to(
                            id,
                            RelayMessage::Pong {
                                data: pong_service.stats(),
                            },
                        );
                    }
                    Err(e) => {
                        WS_INVALID_FRAMES.inc();
                        warn!("Ignoring unparseable client frame: {}", e);
                    }
                },
                Ok(_) => {
                    // Pong is handled automatically by axum
                }
                Err(e) => {
                    warn!("WebSocket receive error: {}", e);
                    break;
                }
            }
        }
    });

    // Whichever side finishes first closes the connection.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    service.unsubscribe(id);
    WS_CONNECTIONS_ACTIVE.dec();
    info!("WebSocket client {} disconnected", id);
}
