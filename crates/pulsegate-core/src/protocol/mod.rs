//! Wire protocol types shared between the gateway and its clients, and
//! between gateway nodes over the pub/sub bus.
//!
//! The client protocol is a single JSON frame shape (lazy-parsed, RawValue
//! `data`) rather than the dual Ext/Hot lane split of earlier wsPrism
//! sprints: this gateway's clients are browsers and native chat/voice
//! clients, not a binary game-input fast path.

pub mod envelope;
pub mod pubsub;

pub use envelope::{ClientFrame, ServerFrame};
pub use pubsub::{Priority, PubSubEnvelope};
