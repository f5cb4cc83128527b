//! WebSocket handler for real-time updates

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use regscope_link::{Observation, SessionEvent, SessionSnapshot};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// WebSocket message types
#[derive(Serialize)]
#[serde(tag = "type", content = "data")]
enum WsMessage {
    #[serde(rename = "snapshot")]
    Snapshot(SessionSnapshot),
    #[serde(rename = "connected")]
    Connected { device: String },
    #[serde(rename = "disconnected")]
    Disconnected,
    #[serde(rename = "map_loaded")]
    MapLoaded {
        name: String,
        version: String,
        registers: usize,
    },
    #[serde(rename = "value_observed")]
    ValueObserved(Observation),
    #[serde(rename = "operation_failed")]
    OperationFailed { operation: String, message: String },
    #[serde(rename = "pong")]
    Pong,
}

impl From<SessionEvent> for WsMessage {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Connected { device } => Self::Connected { device },
            SessionEvent::Disconnected => Self::Disconnected,
            SessionEvent::MapLoaded {
                name,
                version,
                registers,
            } => Self::MapLoaded {
                name,
                version,
                registers,
            },
            SessionEvent::ValueObserved(observation) => Self::ValueObserved(observation),
            SessionEvent::OperationFailed { operation, message } => {
                Self::OperationFailed { operation, message }
            }
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Serialize and send one message; false once the client is gone
async fn send(sender: &mut SplitSink<WebSocket, Message>, msg: &WsMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize WebSocket message");
            true
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.subscribe();

    info!("WebSocket client connected");

    // Send the current session state on connect
    let snapshot = state.session.snapshot().await;
    if !send(&mut sender, &WsMessage::Snapshot(snapshot)).await {
        return;
    }

    loop {
        tokio::select! {
            // Forward session events to client
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if !send(&mut sender, &WsMessage::from(event)).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Session event channel lagged, resending snapshot");
                        let snapshot = state.session.snapshot().await;
                        if !send(&mut sender, &WsMessage::Snapshot(snapshot)).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Session event channel closed");
                        break;
                    }
                }
            }

            // Handle incoming messages from client
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Handle ping/pong for keepalive
                        if text.as_str() == "ping" && !send(&mut sender, &WsMessage::Pong).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}
