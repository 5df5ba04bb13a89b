//! WebSocket event stream
//!
//! One socket per tenant; every event for that tenant is forwarded as a
//! JSON text frame. Slow consumers that lag the broadcast buffer are
//! dropped and must reconnect.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use crate::events::EventHub;

pub fn router(hub: Arc<EventHub>) -> Router {
    Router::new()
        .route("/ws/{tenant}", get(ws_handler))
        .with_state(hub)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(tenant): Path<String>,
    State(hub): State<Arc<EventHub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, tenant, hub))
}

async fn handle_socket(socket: WebSocket, tenant: String, hub: Arc<EventHub>) {
    tracing::debug!(tenant_id = %tenant, "websocket subscriber connected");
    let mut events = hub.subscribe(&tenant);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(tenant_id = %tenant, skipped, "websocket subscriber lagged, closing");
                    break;
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Ping(data))) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(tenant_id = %tenant, error = %e, "websocket read error");
                    break;
                }
            },
        }
    }

    tracing::debug!(tenant_id = %tenant, "websocket subscriber disconnected");
}
