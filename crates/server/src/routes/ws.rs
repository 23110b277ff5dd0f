//! WebSocket endpoint
//!
//! Each socket is registered with the connection manager behind a
//! [`ChannelTransport`]. A writer task drains the channel into the socket; the
//! reader loop hands every text frame to the message router.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use supervisor::ChannelTransport;

use crate::{AppState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: String,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let user_id = query.user_id.trim().to_string();
    if user_id.is_empty() {
        return Err(ApiError::BadRequest("user_id is required".to_string()));
    }
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: String) {
    let (transport, mut outbound) = ChannelTransport::channel(state.config.ws_buffer);
    let connection_id = state.connections.connect(user_id.clone(), Arc::new(transport));
    tracing::info!("[WS] {} connected as {}", user_id, connection_id);

    let (mut sender, mut receiver) = socket.split();

    let reliability = state.engine.reliability().clone();
    let send_timeout = state.config.supervisor.send_timeout();
    let writer_connection = connection_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            let delivered = reliability
                .send_safely(
                    "ws_write",
                    sender.send(Message::Text(text.into())),
                    send_timeout,
                )
                .await;
            if !delivered {
                tracing::warn!("[WS] Write to {} failed, closing writer", writer_connection);
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = receiver.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    // pong is answered by axum
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!("[WS] Receive error on {}: {}", connection_id, e);
                        break;
                    }
                };
                state
                    .engine
                    .router()
                    .handle_message(&connection_id, text.as_str())
                    .await;
            }
            _ = &mut send_task => {
                // writer gave up; stop routing to this socket
                state.connections.mark_dead(&connection_id);
                break;
            }
        }
    }

    send_task.abort();
    state.connections.disconnect(&connection_id);
    tracing::info!("[WS] {} disconnected ({})", user_id, connection_id);
}
