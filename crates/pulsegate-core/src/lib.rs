//! PulseGate core: shared protocol, error, model, and contract types
//! (transport-agnostic; no tokio/axum dependency).

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod contracts;
pub mod error;
pub mod model;
pub mod protocol;

/// Shared result type.
pub use error::{PulseError, Result};
