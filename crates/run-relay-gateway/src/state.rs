//! Gateway shared state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use run_relay_agent::{EncoderSettings, MessageEncoder, StepSource};
use run_relay_core::config::Config;

use crate::history::{HistoryStore, InMemoryHistory};

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub source: Arc<dyn StepSource>,
    pub encoder: MessageEncoder,
    pub history: Arc<dyn HistoryStore>,
    pub sessions: RwLock<HashMap<String, Arc<SessionHub>>>,
}

/// Per-session fan-out point and run bookkeeping.
pub struct SessionHub {
    pub session_id: String,
    /// conn_id -> outbound text frames for that connection.
    pub subscribers: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
    /// Cancellation handle of the active run, if any.
    pub active_run: Mutex<Option<CancellationToken>>,
    step_number: AtomicU32,
}

impl SessionHub {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            subscribers: RwLock::new(HashMap::new()),
            active_run: Mutex::new(None),
            step_number: AtomicU32::new(0),
        }
    }

    /// Highest step number published so far.
    pub fn step_number(&self) -> u32 {
        self.step_number.load(Ordering::SeqCst)
    }

    pub fn observe_step(&self, step: u32) {
        self.step_number.fetch_max(step, Ordering::SeqCst);
    }

    pub async fn subscribe(&self, conn_id: &str, tx: mpsc::UnboundedSender<String>) {
        self.subscribers.write().await.insert(conn_id.to_string(), tx);
    }

    pub async fn unsubscribe(&self, conn_id: &str) {
        self.subscribers.write().await.remove(conn_id);
    }

    pub async fn is_running(&self) -> bool {
        self.active_run.lock().await.is_some()
    }
}

impl GatewayState {
    pub fn new(config: Arc<Config>, source: Arc<dyn StepSource>) -> Self {
        let history = Arc::new(InMemoryHistory::new(config.history_capacity()));
        Self::with_history(config, source, history)
    }

    pub fn with_history(
        config: Arc<Config>,
        source: Arc<dyn StepSource>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let encoder = MessageEncoder::new(EncoderSettings::from_config(&config));
        Self {
            config,
            source,
            encoder,
            history,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Get the hub for a session, creating it on first use.
    pub async fn session(&self, session_id: &str) -> Arc<SessionHub> {
        if let Some(hub) = self.sessions.read().await.get(session_id) {
            return hub.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionHub::new(session_id)))
            .clone()
    }

    /// Get the hub for a session and register `conn_id` on it. Lookup and
    /// subscribe happen under one map lock so [`release`](Self::release)
    /// cannot drop the hub in between.
    pub async fn join(
        &self,
        session_id: &str,
        conn_id: &str,
        tx: mpsc::UnboundedSender<String>,
    ) -> Arc<SessionHub> {
        let mut sessions = self.sessions.write().await;
        let hub = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionHub::new(session_id)))
            .clone();
        hub.subscribe(conn_id, tx).await;
        hub
    }

    /// Drop a hub with no observers, no active run, and no history.
    /// Returns true if it was removed.
    pub async fn release(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(hub) = sessions.get(session_id) else {
            return false;
        };
        if !hub.subscribers.read().await.is_empty() || hub.is_running().await {
            return false;
        }
        match self.history.len(session_id).await {
            Ok(0) => {}
            Ok(_) => return false,
            Err(e) => {
                warn!(%session_id, %e, "Could not read history size, keeping session");
                return false;
            }
        }
        sessions.remove(session_id);
        debug!(%session_id, "Released idle session");
        true
    }

    /// Allocate a new session id. The hub is created when the first
    /// observer connects.
    pub fn create_session(&self) -> String {
        Uuid::new_v4().to_string()
    }

    pub async fn connection_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        let mut total = 0;
        for hub in sessions.values() {
            total += hub.subscribers.read().await.len();
        }
        total
    }
}
