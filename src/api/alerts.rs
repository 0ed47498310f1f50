//! The per-user alert WebSocket and its observability endpoints.
//!
//! `GET /ws/alerts/{user_id}?token=...` upgrades to the persistent alert
//! channel. All writes to the socket flow through the hub's per-user
//! mailbox and a single writer task here, so heartbeats and alerts never
//! interleave mid-frame.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::AppState;
use crate::error::Error;
use crate::messaging::hub::{ChannelStats, CLOSE_UNAUTHORIZED, MAILBOX_CAPACITY};
use crate::messaging::ClientMessage;

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub token: Option<String>,
}

/// `GET /ws/alerts/{user_id}`
pub async fn alerts_ws(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<AlertsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, user_id, query.token, socket))
}

async fn handle_socket(state: AppState, user_id: Uuid, token: Option<String>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    // Authentication happens after the upgrade so the app-level close code
    // reaches the client.
    let authorized = token
        .as_deref()
        .and_then(|t| state.auth.verify(t).ok())
        .map(|claims| claims.sub == user_id)
        .unwrap_or(false);
    if !authorized {
        warn!("[ws] rejected alert channel for user {}", user_id);
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_UNAUTHORIZED,
                reason: "unauthorized".into(),
            })))
            .await;
        return;
    }

    let (tx, mut rx) = mpsc::channel::<Message>(MAILBOX_CAPACITY);
    let channel_id = state.hub.attach(user_id, tx).await;

    // Single outbound writer: drains the hub mailbox in order and stops
    // after forwarding a close frame.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        // Any inbound frame counts as liveness.
        state.hub.touch(user_id).await;

        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Ping { .. }) => state.hub.send_pong(user_id).await,
                Ok(ClientMessage::Pong { .. }) => {}
                Ok(ClientMessage::Ack { stream_id }) => {
                    info!(
                        "[ws] ack from user {} for stream {}",
                        user_id,
                        stream_id
                            .map(|id| id.to_string())
                            .unwrap_or_else(|| "unknown".to_string())
                    );
                }
                Err(_) => debug!("[ws] unparseable message from user {}", user_id),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Only detaches if this socket still owns the channel; a superseded
    // socket must not evict its replacement.
    state.hub.detach(user_id, channel_id).await;
    writer.abort();
    info!("[ws] alert channel closed for user {}", user_id);
}

/// `GET /ws/connections`
pub async fn list_connections(State(state): State<AppState>) -> Json<serde_json::Value> {
    let connections: Vec<ChannelStats> = state.hub.stats_all().await;
    Json(json!({
        "connection_count": connections.len(),
        "connections": connections,
    }))
}

/// `GET /ws/connections/{user_id}`
pub async fn connection_stats(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ChannelStats>, Error> {
    state
        .hub
        .stats(user_id)
        .await
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("no alert channel for user {}", user_id)))
}
