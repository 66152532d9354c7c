//! Error types for the reconciliation core.

use std::time::Duration;

use thiserror::Error;

use crate::model::ObjectKey;

/// Result type for a reconciliation cycle.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Result type for resource store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by a [`crate::ResourceStore`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An object with the same name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency check failed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Errors from schedule evaluation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// The expression is not a valid 5-field schedule.
    #[error("invalid schedule {expr:?}: {message}")]
    InvalidExpression { expr: String, message: String },

    /// More occurrences were missed than the catch-up bound allows.
    #[error("too many missed start times (> {limit})")]
    TooManyMissed { limit: usize },
}

/// Errors that abort a reconciliation cycle.
///
/// Retryable variants make the driver re-run the cycle from scratch. A bad
/// template or an unsaved owner cannot be fixed by retrying; other
/// user-spec problems surface as events and end the cycle normally.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A store call failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The workload name is taken by an object this schedule does not track.
    #[error("workload {name} already exists and is not tracked by {schedule}")]
    CreateConflict { schedule: ObjectKey, name: String },

    /// History eviction could not delete one or more workloads.
    #[error("failed to delete {failed} evicted workload(s) of {schedule}: {source}")]
    EvictionFailed {
        schedule: ObjectKey,
        failed: usize,
        #[source]
        source: StoreError,
    },

    /// The template could not be turned into a workload.
    #[error("invalid workload template: {0}")]
    Template(String),

    /// An owner was used before the store assigned it a uid.
    #[error("{0} has no uid")]
    MissingUid(ObjectKey),

    /// The cycle exceeded the driver's deadline.
    #[error("cycle timed out after {0:?}")]
    Timeout(Duration),
}

impl ReconcileError {
    /// Returns true if re-running the cycle may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ReconcileError::Template(_) | ReconcileError::MissingUid(_)
        )
    }
}
