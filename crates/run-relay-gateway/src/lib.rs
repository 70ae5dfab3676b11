//! Delivery channel for Run Relay.
//!
//! Serves one WebSocket per observer at `/ws/{session_id}`. Every run message
//! is recorded in the session history and fanned out to all observers of the
//! session in emission order.

pub mod commands;
pub mod connection;
pub mod events;
pub mod history;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;

pub use history::{HistoryStore, InMemoryHistory};
pub use server::{build_router, start_gateway};
pub use state::{GatewayState, SessionHub};
