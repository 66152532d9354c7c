//! Error types for event construction.

use thiserror::Error;

/// Errors that can occur when building events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A required builder field was not set.
    #[error("event is missing required field: {0}")]
    MissingField(&'static str),
}
