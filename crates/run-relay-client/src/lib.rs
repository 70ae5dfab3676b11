//! Client half of Run Relay.
//!
//! [`ClientSession`] folds server frames into a reconciled transcript and an
//! agent status. [`run_client`] keeps the WebSocket alive and feeds it.

pub mod connection;
pub mod reconciler;
pub mod router;
pub mod session;
pub mod status;

pub use connection::{run_client, ClientEvent, ClientOptions};
pub use reconciler::{ApplyKind, ApplyOutcome, Entry, EntryState, Reconciler};
pub use router::{route, DisplaySurface, MemorySurface, Route, Surface, Surfaces, View};
pub use session::{ClientSession, SessionEvent};
pub use status::{AgentStatus, StatusTracker};
