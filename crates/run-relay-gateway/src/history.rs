//! Session history: the fetch-by-session interface used for reconnect.
//!
//! The store coalesces fragments: one record per `message_id`, kept at the
//! position of its first emission and holding the latest fragment. Replaying
//! the coalesced log through a reconciler yields the same state as applying
//! every live fragment.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::RwLock;

use run_relay_core::error::Result;
use run_relay_core::message::RunMessage;

/// Storage for a session's transcript fragments.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Record a fragment.
    async fn append(&self, message: &RunMessage) -> Result<()>;

    /// Up to `limit` most recent records, oldest first.
    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<RunMessage>>;

    /// Number of records kept for a session.
    async fn len(&self, session_id: &str) -> Result<usize>;

    async fn clear(&self, session_id: &str) -> Result<()>;
}

#[derive(Default)]
struct SessionLog {
    records: VecDeque<RunMessage>,
    /// message_id -> absolute position (evicted + index).
    positions: HashMap<String, u64>,
    evicted: u64,
}

impl SessionLog {
    fn upsert(&mut self, message: &RunMessage, capacity: usize) {
        let mut record = message.clone();
        // A fresh reader sees this record as the announcement.
        record.metadata.is_delta = false;

        if let Some(&abs) = self.positions.get(&message.message_id) {
            if abs >= self.evicted {
                let idx = (abs - self.evicted) as usize;
                if let Some(slot) = self.records.get_mut(idx) {
                    record.timestamp = slot.timestamp;
                    *slot = record;
                    return;
                }
            }
        }

        let abs = self.evicted + self.records.len() as u64;
        self.positions.insert(record.message_id.clone(), abs);
        self.records.push_back(record);

        while self.records.len() > capacity.max(1) {
            if let Some(old) = self.records.pop_front() {
                if self.positions.get(&old.message_id) == Some(&self.evicted) {
                    self.positions.remove(&old.message_id);
                }
                self.evicted += 1;
            }
        }
    }
}

/// In-process history store.
pub struct InMemoryHistory {
    capacity: usize,
    sessions: RwLock<HashMap<String, SessionLog>>,
}

impl InMemoryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn append(&self, message: &RunMessage) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(message.session_id.clone())
            .or_default()
            .upsert(message, self.capacity);
        Ok(())
    }

    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<RunMessage>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session_id)
            .map(|log| {
                let skip = log.records.len().saturating_sub(limit);
                log.records.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }

    async fn len(&self, session_id: &str) -> Result<usize> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).map(|l| l.records.len()).unwrap_or(0))
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }
}
