//! Declarative resource store interface.
//!
//! The core reads schedules and workloads and writes status through this
//! trait only. Calls carry no timeout; the driver bounds a whole cycle.

mod memory;

pub use memory::{MemoryStore, StoreOp};

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::model::{CronSchedule, ObjectKey, ObjectReference, Uid, Workload};

/// Access to schedule resources and the workloads they own.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a schedule by key.
    async fn get_schedule(&self, key: &ObjectKey) -> StoreResult<CronSchedule>;

    /// Write the status sub-document of `schedule`.
    ///
    /// Fails with `Conflict` if the stored resource version differs from
    /// `schedule.metadata.resource_version`. Returns the stored copy with its
    /// new version.
    async fn update_schedule_status(&self, schedule: &CronSchedule) -> StoreResult<CronSchedule>;

    /// Workloads in `namespace` whose controlling owner is `owner`.
    async fn list_workloads(&self, namespace: &str, owner: Uid) -> StoreResult<Vec<Workload>>;

    /// Fetch a workload by key.
    async fn get_workload(&self, key: &ObjectKey) -> StoreResult<Workload>;

    /// Create a workload. Fails with `AlreadyExists` on a name clash.
    async fn create_workload(&self, workload: Workload) -> StoreResult<Workload>;

    /// Delete a workload. A uid that no longer matches counts as `NotFound`.
    async fn delete_workload(&self, reference: &ObjectReference) -> StoreResult<()>;
}
