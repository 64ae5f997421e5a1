//! # courier-server
//!
//! Real-time messaging and presence delivery core.
//!
//! The crate wires five cooperating subsystems around the SQLite store:
//! a connection registry (live WebSocket sessions), a presence store and
//! typing tracker (ephemeral, TTL-bound state), per-user offline queues
//! (bounded, at-most-once catch-up), and a cross-instance bus so sibling
//! instances converge on one delivery and presence view.  The
//! [`service::ConversationService`] is the single operation layer behind
//! both the WebSocket frame handler and the REST surface.

pub mod api;
pub mod broadcast;
pub mod bus;
pub mod config;
pub mod error;
pub mod offline;
pub mod presence;
pub mod registry;
pub mod service;
pub mod typing;
pub mod ws;
