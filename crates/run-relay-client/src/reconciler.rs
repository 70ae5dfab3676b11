//! Client reconciler: turns an ordered fragment sequence into transcript entries.
//!
//! Entries live in an arena in first-seen order. Two indexes point into it:
//! `by_id` (every `message_id` that has resolved to an entry) and `by_stream`
//! (every `stream_id` an entry was announced under). Lookups never scan.
//!
//! The result depends only on the fragments applied and their order, so
//! rebuilding from fetched history reproduces live state.

use std::collections::HashMap;

use tracing::{debug, warn};

use run_relay_core::message::RunMessage;

/// Lifecycle of one transcript entry. `UNSEEN` is the absence of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Streaming,
    Settled,
}

/// One reconciled transcript entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Stable identity for display: the `message_id` that first created the entry.
    pub display_id: String,
    /// Latest fragment applied, with its cumulative content.
    pub message: RunMessage,
    pub state: EntryState,
}

/// What applying a fragment did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyKind {
    /// A new entry was announced.
    Created,
    /// An existing entry received newer content.
    Updated,
    /// A complete message took over a streaming entry's identity.
    Transferred,
    /// A delta for an unknown identity was kept as a new entry.
    Synthesized,
    /// A stale duplicate; nothing changed.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub display_id: String,
    pub kind: ApplyKind,
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        self.kind != ApplyKind::Ignored
    }
}

fn state_of(message: &RunMessage) -> EntryState {
    if message.is_streaming() {
        EntryState::Streaming
    } else {
        EntryState::Settled
    }
}

#[derive(Debug, Default)]
pub struct Reconciler {
    entries: Vec<Entry>,
    by_id: HashMap<String, usize>,
    by_stream: HashMap<String, usize>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one fragment.
    pub fn apply(&mut self, message: &RunMessage) -> ApplyOutcome {
        if message.is_user_query() {
            self.settle_all();
        }

        if message.is_delta() {
            self.apply_delta(message)
        } else {
            self.apply_announcement(message)
        }
    }

    /// Transcript entries in display order.
    pub fn transcript(&self) -> &[Entry] {
        &self.entries
    }

    /// Resolve any `message_id` (original or successor) to its entry.
    pub fn get(&self, message_id: &str) -> Option<&Entry> {
        self.by_id.get(message_id).map(|&slot| &self.entries[slot])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_id.clear();
        self.by_stream.clear();
    }

    /// Discard all state and rebuild from a fetched history.
    pub fn rebuild<'a>(&mut self, history: impl IntoIterator<Item = &'a RunMessage>) {
        self.clear();
        for message in history {
            self.apply(message);
        }
    }

    /// A new turn begins; fragments still in flight from the previous run are final.
    fn settle_all(&mut self) {
        for entry in self.entries.iter_mut().filter(|e| e.state == EntryState::Streaming) {
            entry.state = EntryState::Settled;
            entry.message.metadata.streaming = false;
        }
    }

    fn lookup_stream(&self, stream_id: &str) -> Option<usize> {
        self.by_stream
            .get(stream_id)
            .or_else(|| self.by_id.get(stream_id))
            .copied()
    }

    fn apply_delta(&mut self, message: &RunMessage) -> ApplyOutcome {
        let slot = self
            .by_id
            .get(&message.message_id)
            .copied()
            .or_else(|| message.stream_id().and_then(|sid| self.lookup_stream(sid)));

        match slot {
            Some(slot) => {
                self.by_id.insert(message.message_id.clone(), slot);
                self.update(slot, message)
            }
            None => {
                warn!(
                    message_id = %message.message_id,
                    stream_id = ?message.stream_id(),
                    "Delta for unknown message, synthesizing entry"
                );
                let display_id = self.insert(message);
                ApplyOutcome {
                    display_id,
                    kind: ApplyKind::Synthesized,
                }
            }
        }
    }

    fn apply_announcement(&mut self, message: &RunMessage) -> ApplyOutcome {
        // Re-delivery of an identity we already hold.
        if let Some(&slot) = self.by_id.get(&message.message_id) {
            return self.update(slot, message);
        }

        let target = message
            .stream_id()
            .filter(|sid| *sid != message.message_id)
            .and_then(|sid| self.lookup_stream(sid))
            .filter(|&slot| self.entries[slot].state == EntryState::Streaming);

        if let Some(slot) = target {
            self.by_id.insert(message.message_id.clone(), slot);
            let entry = &mut self.entries[slot];
            entry.message = message.clone();
            entry.state = state_of(message);
            debug!(
                display_id = %entry.display_id,
                message_id = %message.message_id,
                "Identity transferred"
            );
            return ApplyOutcome {
                display_id: entry.display_id.clone(),
                kind: ApplyKind::Transferred,
            };
        }

        let display_id = self.insert(message);
        ApplyOutcome {
            display_id,
            kind: ApplyKind::Created,
        }
    }

    fn insert(&mut self, message: &RunMessage) -> String {
        let slot = self.entries.len();
        self.by_id.insert(message.message_id.clone(), slot);
        if let Some(sid) = message.stream_id() {
            self.by_stream.entry(sid.to_string()).or_insert(slot);
        }
        self.entries.push(Entry {
            display_id: message.message_id.clone(),
            message: message.clone(),
            state: state_of(message),
        });
        message.message_id.clone()
    }

    fn update(&mut self, slot: usize, message: &RunMessage) -> ApplyOutcome {
        let entry = &mut self.entries[slot];
        if is_stale(entry, message) {
            debug!(message_id = %message.message_id, "Ignoring stale fragment");
            return ApplyOutcome {
                display_id: entry.display_id.clone(),
                kind: ApplyKind::Ignored,
            };
        }

        // Content is cumulative: replace, never append.
        entry.message = message.clone();
        entry.state = state_of(message);
        ApplyOutcome {
            display_id: entry.display_id.clone(),
            kind: ApplyKind::Updated,
        }
    }
}

/// A streaming fragment can never move a settled entry back, nor shorten content
/// that a later fragment already extended.
fn is_stale(entry: &Entry, message: &RunMessage) -> bool {
    if !message.is_streaming() {
        return false;
    }
    match entry.state {
        EntryState::Settled => true,
        EntryState::Streaming => {
            let current = &entry.message.content;
            message.content.len() < current.len() && current.starts_with(&message.content)
        }
    }
}
