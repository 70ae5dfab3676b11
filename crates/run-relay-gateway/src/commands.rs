//! Client command handlers.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use run_relay_agent::{drive_run, RunContext};
use run_relay_core::message::RunMessage;
use run_relay_core::protocol::{ClientCommand, ControlFrame, ServerFrame, SessionState};

use crate::events::publish_message;
use crate::state::{GatewayState, SessionHub};

fn command_name(command: &ClientCommand) -> &'static str {
    match command {
        ClientCommand::Query { .. } => "query",
        ClientCommand::Cancel => "cancel",
        ClientCommand::Ping => "ping",
        ClientCommand::GetMessages { .. } => "get_messages",
        ClientCommand::GetState => "get_state",
    }
}

/// Dispatch a command and return the reply frame for the sender, if any.
///
/// A successful query has no direct reply: its user message and the run's
/// output reach every subscriber through the session hub.
pub async fn dispatch_command(
    state: &Arc<GatewayState>,
    hub: &Arc<SessionHub>,
    command: ClientCommand,
) -> Option<ServerFrame> {
    let name = command_name(&command);
    debug!(session_id = %hub.session_id, command = name, "Dispatching command");

    #[cfg(feature = "metrics")]
    crate::metrics::record_command(name);

    match command {
        ClientCommand::Query { query } => handle_query(state, hub, query).await,
        ClientCommand::Cancel => {
            handle_cancel(hub).await;
            None
        }
        ClientCommand::Ping => Some(ControlFrame::Pong.into()),
        ClientCommand::GetMessages { limit } => Some(handle_get_messages(state, hub, limit).await),
        ClientCommand::GetState => Some(handle_get_state(state, hub).await),
    }
}

async fn handle_query(
    state: &Arc<GatewayState>,
    hub: &Arc<SessionHub>,
    query: String,
) -> Option<ServerFrame> {
    if query.trim().is_empty() {
        return Some(ServerFrame::error("Query must not be empty"));
    }

    let cancel = {
        let mut active = hub.active_run.lock().await;
        if active.is_some() {
            return Some(ServerFrame::error(
                "A run is already in progress for this session",
            ));
        }
        let token = CancellationToken::new();
        *active = Some(token.clone());
        token
    };

    start_run(state.clone(), hub.clone(), query, cancel);
    None
}

/// Spawn a run for the session. Output is published by a single forwarder
/// task so subscribers observe emission order.
fn start_run(
    state: Arc<GatewayState>,
    hub: Arc<SessionHub>,
    query: String,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<RunMessage>();

    let forwarder = {
        let hub = hub.clone();
        let history = state.history.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                publish_message(&hub, &history, message).await;
            }
        })
    };

    tokio::spawn(async move {
        #[cfg(feature = "metrics")]
        crate::metrics::record_run_start();

        info!(session_id = %hub.session_id, "Starting run via gateway");
        let ctx = RunContext::new(hub.session_id.clone(), hub.step_number());
        let outcome = drive_run(
            state.source.clone(),
            &state.encoder,
            ctx,
            query,
            cancel,
            tx,
        )
        .await;

        // The sender was moved into drive_run, so the forwarder drains and exits.
        if let Err(e) = forwarder.await {
            error!(session_id = %hub.session_id, %e, "Message forwarder aborted");
        }
        hub.observe_step(outcome.last_step);
        hub.active_run.lock().await.take();

        #[cfg(feature = "metrics")]
        crate::metrics::record_run_end();

        info!(
            session_id = %hub.session_id,
            status = ?outcome.status,
            last_step = outcome.last_step,
            "Run ended"
        );
    });
}

async fn handle_cancel(hub: &Arc<SessionHub>) {
    let active = hub.active_run.lock().await;
    match active.as_ref() {
        Some(token) => {
            info!(session_id = %hub.session_id, "Cancelling run");
            token.cancel();
        }
        None => debug!(session_id = %hub.session_id, "Cancel with no active run"),
    }
}

async fn handle_get_messages(
    state: &Arc<GatewayState>,
    hub: &Arc<SessionHub>,
    limit: Option<usize>,
) -> ServerFrame {
    let limit = limit
        .unwrap_or_else(|| state.config.history_limit())
        .min(state.config.max_history_limit());
    match state.history.recent(&hub.session_id, limit).await {
        Ok(messages) => ControlFrame::Messages { messages }.into(),
        Err(e) => ServerFrame::error(format!("Failed to load history: {e}")),
    }
}

async fn handle_get_state(state: &Arc<GatewayState>, hub: &Arc<SessionHub>) -> ServerFrame {
    let message_count = state.history.len(&hub.session_id).await.unwrap_or(0);
    let snapshot = SessionState {
        session_id: hub.session_id.clone(),
        running: hub.is_running().await,
        step_number: hub.step_number(),
        message_count,
        subscribers: hub.subscribers.read().await.len(),
    };
    ControlFrame::State { state: snapshot }.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use run_relay_agent::{ScriptedSource, StepSource};
    use run_relay_core::config::Config;
    use run_relay_core::message::MessageType;
    use std::time::Duration;

    fn make_state(source: ScriptedSource) -> Arc<GatewayState> {
        let source: Arc<dyn StepSource> = Arc::new(source);
        Arc::new(GatewayState::new(Arc::new(Config::default()), source))
    }

    async fn wait_idle(hub: &Arc<SessionHub>) {
        for _ in 0..200 {
            if !hub.is_running().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run did not finish");
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let state = make_state(ScriptedSource::default());
        let hub = state.session("s1").await;
        let reply = dispatch_command(&state, &hub, ClientCommand::Ping).await;
        assert_eq!(reply, Some(ControlFrame::Pong.into()));
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let state = make_state(ScriptedSource::default());
        let hub = state.session("s1").await;
        let reply = dispatch_command(
            &state,
            &hub,
            ClientCommand::Query { query: "   ".into() },
        )
        .await;
        assert!(matches!(
            reply,
            Some(ServerFrame::Control(ControlFrame::Error { .. }))
        ));
    }

    #[tokio::test]
    async fn test_query_records_history_and_state() {
        let state = make_state(ScriptedSource::demo().with_delay(Duration::ZERO));
        let hub = state.session("s1").await;
        let reply = dispatch_command(
            &state,
            &hub,
            ClientCommand::Query {
                query: "capital of France?".into(),
            },
        )
        .await;
        assert!(reply.is_none());
        wait_idle(&hub).await;

        let Some(ServerFrame::Control(ControlFrame::Messages { messages })) = dispatch_command(
            &state,
            &hub,
            ClientCommand::GetMessages { limit: None },
        )
        .await
        else {
            panic!("expected messages frame");
        };
        assert_eq!(messages[0].message_type(), Some(MessageType::UserQuery));
        assert_eq!(
            messages.last().and_then(|m| m.message_type()),
            Some(MessageType::FinalAnswer)
        );

        let Some(ServerFrame::Control(ControlFrame::State { state: snapshot })) =
            dispatch_command(&state, &hub, ClientCommand::GetState).await
        else {
            panic!("expected state frame");
        };
        assert!(!snapshot.running);
        assert_eq!(snapshot.step_number, 3);
        assert_eq!(snapshot.message_count, messages.len());
    }

    #[tokio::test]
    async fn test_get_messages_limit_is_capped() {
        let state = make_state(ScriptedSource::demo().with_delay(Duration::ZERO));
        let hub = state.session("s1").await;
        dispatch_command(&state, &hub, ClientCommand::Query { query: "q".into() }).await;
        wait_idle(&hub).await;

        let Some(ServerFrame::Control(ControlFrame::Messages { messages })) = dispatch_command(
            &state,
            &hub,
            ClientCommand::GetMessages { limit: Some(2) },
        )
        .await
        else {
            panic!("expected messages frame");
        };
        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages.last().and_then(|m| m.message_type()),
            Some(MessageType::FinalAnswer)
        );
    }

    #[tokio::test]
    async fn test_second_query_while_running_rejected() {
        let state = make_state(ScriptedSource::demo().with_delay(Duration::from_millis(200)));
        let hub = state.session("s1").await;
        assert!(
            dispatch_command(&state, &hub, ClientCommand::Query { query: "a".into() })
                .await
                .is_none()
        );
        let reply =
            dispatch_command(&state, &hub, ClientCommand::Query { query: "b".into() }).await;
        assert!(matches!(
            reply,
            Some(ServerFrame::Control(ControlFrame::Error { .. }))
        ));

        dispatch_command(&state, &hub, ClientCommand::Cancel).await;
        wait_idle(&hub).await;
    }

    #[tokio::test]
    async fn test_cancel_without_run_is_noop() {
        let state = make_state(ScriptedSource::default());
        let hub = state.session("s1").await;
        assert!(dispatch_command(&state, &hub, ClientCommand::Cancel)
            .await
            .is_none());
    }
}
