//! WebSocket transport for the live parsing protocol.
//!
//! The reader half feeds text frames to a [`Connection`]; a writer task
//! drains the connection's outbound channel into the socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use larkline_live::{Connection, ConnectionHandle};

use super::state::AppState;

/// GET /ws/parsing
pub(crate) async fn handle_ws(State(state): State<Arc<AppState>>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| run_socket(state, socket))
}

async fn run_socket(state: Arc<AppState>, socket: WebSocket) {
    let (handle, mut outbound) = ConnectionHandle::channel(state.config.outbound_buffer);
    let mut connection = Connection::new(state.coordinator.clone(), handle);
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if sink.send(Message::Text(message.to_json().into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => connection.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(connection = %connection.id(), error = %e, "websocket read failed");
                break;
            }
        }
    }

    connection.disconnect();
    drop(connection);
    writer.abort();
}
