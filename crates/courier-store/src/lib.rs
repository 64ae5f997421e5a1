//! # courier-store
//!
//! Relational persistence for the messaging core, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for every domain
//! model: conversations, participants, messages, attachments, reactions,
//! read receipts, blocks, and per-user conversation settings.  Row-level
//! uniqueness constraints (direct-conversation key, one reaction per
//! (message, user, emoji), one receipt per (message, user)) carry the
//! idempotency guarantees the delivery layer relies on.

pub mod attachments;
pub mod blocks;
pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod participants;
pub mod reactions;
pub mod receipts;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
