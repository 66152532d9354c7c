//! # cadence-events
//!
//! Human-readable events attached to schedule resources.
//!
//! ## Design Principles
//!
//! - Events are fire-and-forget: recording never fails and never blocks a
//!   reconciliation decision
//! - Every event is attached to exactly one involved object
//! - Reasons come from a fixed vocabulary (see [`reasons`])
//!
//! ## Sinks
//!
//! - [`TracingSink`] writes each event as a structured log line
//! - [`MemorySink`] collects events in memory (tests, debugging)

mod envelope;
mod error;
mod sink;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use sink::*;
pub use types::*;
