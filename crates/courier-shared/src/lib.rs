//! # courier-shared
//!
//! Wire protocol and domain types shared between the courier server and its
//! clients.  The envelope format is JSON: every frame is an object with a
//! `type` tag and a `data` payload, checked at compile time through the
//! [`ClientFrame`] / [`ServerFrame`] enums.

pub mod envelope;
pub mod types;

pub use envelope::{ClientFrame, ServerFrame};
pub use types::*;
