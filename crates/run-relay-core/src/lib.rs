//! Core types, wire protocol, errors, and config for Run Relay.

pub mod config;
pub mod error;
pub mod message;
pub mod protocol;
