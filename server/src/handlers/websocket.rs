//! WebSocket handler for live subscriptions.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::websocket::{ClientMessage, ServerMessage, SubscriptionManager};

/// Handle an established WebSocket connection.
///
/// Outgoing messages, both replies and published mutations, go through the
/// connection's channel so a single task owns the socket's write half.
pub async fn handle_websocket_connection(
    socket: WebSocket,
    subscriptions: Arc<SubscriptionManager>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn_id = subscriptions.register(tx);

    tracing::info!(conn_id = %conn_id, "WebSocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let response = process_message(&text, &subscriptions, &conn_id);
                subscriptions.send_to(&conn_id, response);
            }
            Ok(Message::Binary(_)) => {
                subscriptions.send_to(
                    &conn_id,
                    ServerMessage::error("binary messages are not supported", None),
                );
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    subscriptions.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        active_connections = subscriptions.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Process a client message and return the reply.
pub fn process_message(
    text: &str,
    subscriptions: &SubscriptionManager,
    conn_id: &str,
) -> ServerMessage {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return ServerMessage::error(format!("Invalid message format: {}", e), None);
        }
    };

    match client_msg {
        ClientMessage::Subscribe { model } => {
            if model.is_empty() {
                return ServerMessage::error("model is required", None);
            }
            if subscriptions.subscribe(conn_id, &model) {
                ServerMessage::SubscriptionAck { model }
            } else {
                ServerMessage::error("connection is not registered", Some(model))
            }
        }
        ClientMessage::Unsubscribe { model } => {
            subscriptions.unsubscribe(conn_id, &model);
            ServerMessage::SubscriptionAck { model }
        }
        ClientMessage::Ping => ServerMessage::Pong,
    }
}
