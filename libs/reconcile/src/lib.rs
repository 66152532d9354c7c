//! Cron schedule reconciliation.
//!
//! This library turns a declared cron schedule into workloads on a
//! declarative store, one level-triggered cycle at a time. Key pieces:
//!
//! - **Schedule evaluator** ([`schedule`]): which slot, if any, is due now.
//! - **Concurrency enforcer** ([`concurrency`]): whether active workloads
//!   block, or get replaced by, the due slot.
//! - **Lifecycle classifier** ([`lifecycle`]): unfinished or finished, per
//!   workload kind.
//! - **Active-set reconciler** ([`active`]) and **history compactor**
//!   ([`history`]): keep the recorded status in line with the store.
//! - **Controller** ([`controller`]): runs one cycle end to end.
//!
//! # Invariants
//!
//! - The active set never holds a workload observed as finished
//! - History is ordered by creation time and never longer than the limit
//! - The last schedule time only moves forward, and only once a workload
//!   for that slot has been accepted
//! - Re-running a cycle with nothing new to do leaves status unchanged

pub mod active;
pub mod concurrency;
pub mod controller;
mod error;
pub mod hash;
pub mod history;
pub mod lifecycle;
pub mod model;
pub mod notice;
pub mod schedule;
pub mod store;
pub mod workload;

pub use controller::{CronController, CyclePhase, ReconcileOutcome};
pub use error::{ReconcileError, ReconcileResult, ScheduleError, StoreError, StoreResult};
pub use hash::InputDigest;
pub use lifecycle::{KindRegistry, Lifecycle, WorkloadKind, WorkloadObservation};
pub use model::*;
pub use notice::{NoticeTracker, DEFAULT_NOTICE_INTERVAL};
pub use schedule::{CronExpr, MAX_MISSED_SCHEDULES};
pub use store::{MemoryStore, ResourceStore, StoreOp};

/// Default periodic resync when no slot is pending.
pub const DEFAULT_RESYNC_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);
