//! Client session: reconciler, router, and status tracker on one event loop.

use tracing::{debug, info, warn};

use run_relay_core::message::RunMessage;
use run_relay_core::protocol::{ControlFrame, ServerFrame, SessionState};

use crate::reconciler::{ApplyOutcome, Entry, Reconciler};
use crate::router::{route, Route};
use crate::status::{AgentStatus, StatusTracker};

/// What handling one server frame changed.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A run message was reconciled.
    Message {
        outcome: ApplyOutcome,
        /// `None` for structural messages and ignored fragments.
        route: Option<Route>,
        status: AgentStatus,
    },
    /// State was rebuilt from fetched history.
    Resynced { entries: usize, status: AgentStatus },
    /// A live message was held back until the pending resync completes.
    Buffered,
    Pong,
    State(SessionState),
    /// Protocol failure reported by the server; surfaced, never retried.
    Error(String),
}

/// All client-side state for one observed session.
#[derive(Debug, Default)]
pub struct ClientSession {
    reconciler: Reconciler,
    status: StatusTracker,
    /// Live messages received while a history fetch is outstanding.
    pending_resync: Option<Vec<RunMessage>>,
}

impl ClientSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> AgentStatus {
        self.status.status()
    }

    pub fn transcript(&self) -> &[Entry] {
        self.reconciler.transcript()
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// A history fetch was requested after (re)connecting. Live messages are
    /// held until its reply arrives and then replayed on top of it.
    pub fn begin_resync(&mut self) {
        debug!("Awaiting history for resync");
        self.pending_resync = Some(Vec::new());
    }

    pub fn is_resyncing(&self) -> bool {
        self.pending_resync.is_some()
    }

    pub fn handle_frame(&mut self, frame: ServerFrame) -> SessionEvent {
        match frame {
            ServerFrame::Message(message) => {
                if let Some(buffer) = self.pending_resync.as_mut() {
                    buffer.push(*message);
                    return SessionEvent::Buffered;
                }
                self.apply(&message)
            }
            ServerFrame::Control(ControlFrame::Messages { messages }) => self.resync(messages),
            ServerFrame::Control(ControlFrame::Pong) => SessionEvent::Pong,
            ServerFrame::Control(ControlFrame::State { state }) => SessionEvent::State(state),
            ServerFrame::Control(ControlFrame::Error { message }) => {
                warn!(%message, "Server reported an error");
                SessionEvent::Error(message)
            }
        }
    }

    /// Apply one live message.
    pub fn apply(&mut self, message: &RunMessage) -> SessionEvent {
        let outcome = self.reconciler.apply(message);
        let route = if outcome.changed() {
            self.status.observe(message);
            self.reconciler
                .get(&message.message_id)
                .and_then(|entry| route(&entry.message))
        } else {
            None
        };
        SessionEvent::Message {
            outcome,
            route,
            status: self.status.status(),
        }
    }

    /// Discard all state and rebuild it from `history`, then replay anything
    /// that arrived live while the fetch was outstanding.
    pub fn resync(&mut self, history: Vec<RunMessage>) -> SessionEvent {
        let buffered = self.pending_resync.take().unwrap_or_default();

        self.reconciler.clear();
        self.status.reset();
        for message in history.iter().chain(buffered.iter()) {
            if self.reconciler.apply(message).changed() {
                self.status.observe(message);
            }
        }

        let entries = self.reconciler.len();
        info!(
            entries,
            replayed = buffered.len(),
            status = %self.status.status(),
            "Resynced from history"
        );
        SessionEvent::Resynced {
            entries,
            status: self.status.status(),
        }
    }
}
