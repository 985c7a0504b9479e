//! WebSocket handler for replication traffic.
//!
//! The socket is a dumb pipe: frames in become [`HostEvent::Message`]s for
//! the game loop, and bytes the engine addresses to this connection go out
//! as text frames.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::websocket::{ConnectionManager, EventSender, HostEvent};

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the connection with the manager
/// 2. Spawns a task to forward outgoing frames
/// 3. Forwards incoming frames to the game loop
/// 4. Cleans up on disconnect
pub async fn handle_websocket_connection(
    socket: WebSocket,
    conn_manager: Arc<ConnectionManager>,
    events: EventSender,
    profile: Option<u32>,
) {
    // Split the socket into sender and receiver
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create channel for sending frames to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let conn_id = conn_manager.register(profile, tx);
    let session = conn_manager.session(conn_id).unwrap_or_default();

    if events
        .send(HostEvent::Connected {
            connection: conn_id,
            profile,
        })
        .is_err()
    {
        tracing::error!(conn_id, "Game loop is gone, refusing connection");
        conn_manager.unregister(conn_id);
        return;
    }

    tracing::info!(conn_id, session = %session, "WebSocket client connected");

    // Spawn task to forward frames from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            let frame = match String::from_utf8(bytes) {
                Ok(text) => Message::Text(text.into()),
                Err(e) => Message::Binary(e.into_bytes().into()),
            };
            if let Err(e) = ws_sender.send(frame).await {
                tracing::warn!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    // Process incoming frames
    while let Some(result) = ws_receiver.next().await {
        let bytes = match result {
            Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Ping(data)) => {
                // Axum answers pings itself
                tracing::trace!("Received ping: {} bytes", data.len());
                continue;
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
                continue;
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id, "WebSocket error: {}", e);
                break;
            }
        };

        if events
            .send(HostEvent::Message {
                connection: conn_id,
                bytes,
            })
            .is_err()
        {
            tracing::error!(conn_id, "Game loop is gone, closing connection");
            break;
        }
    }

    // Clean up
    let _ = events.send(HostEvent::Disconnected {
        connection: conn_id,
    });
    conn_manager.unregister(conn_id);
    send_task.abort();

    tracing::info!(
        conn_id,
        session = %session,
        active_connections = conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}
