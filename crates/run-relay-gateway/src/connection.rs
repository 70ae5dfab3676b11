//! WebSocket connection lifecycle: subscribe, read loop, idle timeout.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use run_relay_core::protocol::{ClientCommand, ServerFrame};

use crate::commands::dispatch_command;
use crate::state::{GatewayState, SessionHub};

fn send_frame(tx: &mpsc::UnboundedSender<String>, frame: &ServerFrame) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            let _ = tx.send(text);
        }
        Err(e) => error!(%e, "Failed to serialize server frame"),
    }
}

/// Handle a new WebSocket connection observing `session_id`.
pub async fn handle_ws_connection(state: Arc<GatewayState>, session_id: String, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(%conn_id, %session_id, "New WebSocket connection");

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect();

    let (mut ws_tx, mut ws_rx) = ws.split();

    // Run messages and replies share one queue so a connection sees them in order.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();
    let hub = state.join(&session_id, &conn_id, event_tx.clone()).await;

    let send_task = tokio::spawn(async move {
        while let Some(msg) = event_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let idle_timeout = Duration::from_secs(state.config.heartbeat_timeout_secs());

    loop {
        let next = match tokio::time::timeout(idle_timeout, ws_rx.next()).await {
            Ok(next) => next,
            Err(_) => {
                warn!(%conn_id, %session_id, "No heartbeat within timeout, closing connection");
                break;
            }
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                handle_text(&state, &hub, &event_tx, text.as_str()).await;
            }
            Some(Ok(Message::Close(_))) => {
                debug!(%conn_id, "Client requested close");
                break;
            }
            Some(Ok(_)) => {
                // Binary and transport-level ping/pong frames still count as liveness.
            }
            Some(Err(e)) => {
                error!(%conn_id, %e, "WebSocket error");
                break;
            }
            None => break,
        }
    }

    hub.unsubscribe(&conn_id).await;
    drop(event_tx);
    send_task.abort();
    state.release(&session_id).await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect();

    info!(%conn_id, %session_id, "WebSocket connection closed");
}

async fn handle_text(
    state: &Arc<GatewayState>,
    hub: &Arc<SessionHub>,
    event_tx: &mpsc::UnboundedSender<String>,
    text: &str,
) {
    match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => {
            if let Some(reply) = dispatch_command(state, hub, command).await {
                send_frame(event_tx, &reply);
            }
        }
        Err(e) => {
            warn!(session_id = %hub.session_id, %e, "Invalid command received");
            send_frame(event_tx, &ServerFrame::error(format!("Invalid command: {e}")));
        }
    }
}
