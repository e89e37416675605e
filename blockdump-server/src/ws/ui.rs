//! Live job feed for UI clients: one `snapshot` message, then every
//! [`JobEvent`] as it happens.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use blockdump::JobEvent;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ui_socket(socket, state))
}

async fn handle_ui_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribe before taking the snapshot so nothing falls in between.
    let mut rx = state.manager.subscribe();

    let snapshot_state = state.clone();
    let send_task = tokio::spawn(async move {
        if send_snapshot(&mut sender, &snapshot_state).await.is_err() {
            return;
        }
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "UI client lagged, resending snapshot");
                    if send_snapshot(&mut sender, &snapshot_state).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // The feed is one-way; read only to notice the close.
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    close_together(send_task, recv_task).await;
}

/// Wait for either half of a socket, then stop the other.
async fn close_together(mut first: JoinHandle<()>, mut second: JoinHandle<()>) {
    tokio::select! {
        _ = &mut first => second.abort(),
        _ = &mut second => first.abort(),
    }
}

async fn send_snapshot(
    sender: &mut SplitSink<WebSocket, Message>,
    state: &AppState,
) -> Result<(), axum::Error> {
    let msg = json!({
        "type": "snapshot",
        "payload": state.manager.list(),
    });
    sender.send(Message::Text(msg.to_string().into())).await
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &JobEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => sender.send(Message::Text(text.into())).await,
        Err(e) => {
            tracing::warn!("Failed to serialize job event: {}", e);
            Ok(())
        }
    }
}
