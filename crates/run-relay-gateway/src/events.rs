//! Ordered delivery of run messages to every observer of a session.

use std::sync::Arc;

use tracing::{debug, error, warn};

use run_relay_core::message::RunMessage;
use run_relay_core::protocol::ServerFrame;

use crate::history::HistoryStore;
use crate::state::SessionHub;

/// Record a message in history, then send it to all subscribers of its session.
///
/// Callers publish from a single task per run, so every connection receives
/// messages in emission order.
pub async fn publish_message(hub: &Arc<SessionHub>, history: &Arc<dyn HistoryStore>, message: RunMessage) {
    if let Err(e) = history.append(&message).await {
        warn!(session_id = %hub.session_id, %e, "Failed to record message in history");
    }
    hub.observe_step(message.step_number);

    let message_id = message.message_id.clone();
    let text = match serde_json::to_string(&ServerFrame::from(message)) {
        Ok(t) => t,
        Err(e) => {
            error!(%e, "Failed to serialize run message");
            return;
        }
    };

    let subscribers = hub.subscribers.read().await;
    let mut sent = 0;
    for tx in subscribers.values() {
        if tx.send(text.clone()).is_ok() {
            sent += 1;
        }
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_message_published();

    debug!(session_id = %hub.session_id, %message_id, sent, "Published run message");
}
