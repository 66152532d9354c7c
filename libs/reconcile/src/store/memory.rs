//! In-memory resource store.
//!
//! Backs the controller process and the tests. Every write bumps a single
//! store-wide resource version. The clock can be pinned so creation times
//! are deterministic, and failures can be queued per operation.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::ResourceStore;
use crate::error::{StoreError, StoreResult};
use crate::model::{CronSchedule, ObjectKey, ObjectReference, Uid, Workload};

/// Store operations, for failure injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreOp {
    GetSchedule,
    UpdateScheduleStatus,
    ListWorkloads,
    GetWorkload,
    CreateWorkload,
    DeleteWorkload,
}

#[derive(Debug, Default)]
struct State {
    schedules: BTreeMap<ObjectKey, CronSchedule>,
    workloads: BTreeMap<ObjectKey, Workload>,
    version: u64,
    clock: Option<DateTime<Utc>>,
    failures: HashMap<StoreOp, VecDeque<StoreError>>,
    calls: BTreeMap<StoreOp, usize>,
}

impl State {
    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// Counts the call and pops an injected failure, if any.
    fn enter(&mut self, op: StoreOp) -> StoreResult<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!(?op, error = %err, "injected store failure");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

/// In-memory [`ResourceStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the store clock used for creation timestamps.
    pub async fn set_time(&self, now: DateTime<Utc>) {
        self.state.write().await.clock = Some(now);
    }

    /// Current store time.
    pub async fn now(&self) -> DateTime<Utc> {
        self.state.read().await.now()
    }

    /// Makes the next call to `op` fail with `err`. Queued failures are
    /// consumed in order.
    pub async fn fail_next(&self, op: StoreOp, err: StoreError) {
        self.state
            .write()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Number of calls made to `op` so far.
    pub async fn calls(&self, op: StoreOp) -> usize {
        self.state
            .read()
            .await
            .calls
            .get(&op)
            .copied()
            .unwrap_or_default()
    }

    /// Creates or replaces a schedule.
    ///
    /// A new schedule gets a uid and creation time unless it carries them.
    /// Replacing keeps the stored identity and status; only metadata labels
    /// and `spec` are taken from `schedule`.
    pub async fn apply_schedule(&self, schedule: CronSchedule) -> CronSchedule {
        let mut state = self.state.write().await;
        let now = state.now();
        let version = state.next_version();
        let key = schedule.key();

        let stored = match state.schedules.remove(&key) {
            Some(mut existing) => {
                existing.spec = schedule.spec;
                existing.metadata.labels = schedule.metadata.labels;
                existing.metadata.annotations = schedule.metadata.annotations;
                existing
            }
            None => {
                let mut created = schedule;
                created.metadata.uid.get_or_insert_with(Uid::new);
                created.metadata.creation_timestamp.get_or_insert(now);
                created
            }
        };

        let mut stored = stored;
        stored.metadata.resource_version = Some(version);
        state.schedules.insert(key, stored.clone());
        stored
    }

    /// Applies `f` to a stored schedule, bumping its version.
    pub async fn modify_schedule<F>(&self, key: &ObjectKey, f: F) -> StoreResult<CronSchedule>
    where
        F: FnOnce(&mut CronSchedule),
    {
        let mut state = self.state.write().await;
        let version = state.next_version();
        let schedule = state
            .schedules
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("schedule {key}")))?;
        f(schedule);
        schedule.metadata.resource_version = Some(version);
        Ok(schedule.clone())
    }

    /// Removes a schedule and every workload it controls.
    pub async fn remove_schedule(&self, key: &ObjectKey) -> Option<CronSchedule> {
        let mut state = self.state.write().await;
        let removed = state.schedules.remove(key)?;
        if let Some(uid) = removed.metadata.uid {
            state
                .workloads
                .retain(|_, w| !w.metadata.is_controlled_by(uid));
        }
        state.next_version();
        Some(removed)
    }

    /// Snapshot of a stored schedule.
    pub async fn schedule(&self, key: &ObjectKey) -> Option<CronSchedule> {
        self.state.read().await.schedules.get(key).cloned()
    }

    /// Keys of every stored schedule.
    pub async fn schedule_keys(&self) -> Vec<ObjectKey> {
        self.state.read().await.schedules.keys().cloned().collect()
    }

    /// Inserts or replaces a workload as an outside actor would.
    pub async fn put_workload(&self, workload: Workload) -> Workload {
        let mut state = self.state.write().await;
        let now = state.now();
        let version = state.next_version();

        let mut workload = workload;
        workload.metadata.uid.get_or_insert_with(Uid::new);
        workload.metadata.creation_timestamp.get_or_insert(now);
        workload.metadata.resource_version = Some(version);
        state.workloads.insert(workload.key(), workload.clone());
        workload
    }

    /// Applies `f` to a stored workload, e.g. to report a condition.
    pub async fn modify_workload<F>(&self, key: &ObjectKey, f: F) -> StoreResult<Workload>
    where
        F: FnOnce(&mut Workload),
    {
        let mut state = self.state.write().await;
        let version = state.next_version();
        let workload = state
            .workloads
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("workload {key}")))?;
        f(workload);
        workload.metadata.resource_version = Some(version);
        Ok(workload.clone())
    }

    /// Removes a workload behind the controller's back.
    pub async fn remove_workload(&self, key: &ObjectKey) -> Option<Workload> {
        self.state.write().await.workloads.remove(key)
    }

    /// Snapshot of every stored workload, ordered by key.
    pub async fn workloads(&self) -> Vec<Workload> {
        self.state.read().await.workloads.values().cloned().collect()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_schedule(&self, key: &ObjectKey) -> StoreResult<CronSchedule> {
        let mut state = self.state.write().await;
        state.enter(StoreOp::GetSchedule)?;
        state
            .schedules
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("schedule {key}")))
    }

    async fn update_schedule_status(&self, schedule: &CronSchedule) -> StoreResult<CronSchedule> {
        let mut state = self.state.write().await;
        state.enter(StoreOp::UpdateScheduleStatus)?;
        let version = state.version + 1;

        let key = schedule.key();
        let stored = state
            .schedules
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("schedule {key}")))?;

        if stored.metadata.resource_version != schedule.metadata.resource_version {
            return Err(StoreError::Conflict(format!(
                "schedule {key}: resource version {:?} is stale (stored {:?})",
                schedule.metadata.resource_version, stored.metadata.resource_version
            )));
        }

        stored.status = schedule.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.version = version;
        Ok(updated)
    }

    async fn list_workloads(&self, namespace: &str, owner: Uid) -> StoreResult<Vec<Workload>> {
        let mut state = self.state.write().await;
        state.enter(StoreOp::ListWorkloads)?;
        let mut owned: Vec<Workload> = state
            .workloads
            .values()
            .filter(|w| w.metadata.namespace == namespace && w.metadata.is_controlled_by(owner))
            .cloned()
            .collect();
        owned.sort_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        Ok(owned)
    }

    async fn get_workload(&self, key: &ObjectKey) -> StoreResult<Workload> {
        let mut state = self.state.write().await;
        state.enter(StoreOp::GetWorkload)?;
        state
            .workloads
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("workload {key}")))
    }

    async fn create_workload(&self, workload: Workload) -> StoreResult<Workload> {
        let mut state = self.state.write().await;
        state.enter(StoreOp::CreateWorkload)?;

        if workload.metadata.name.is_empty() {
            return Err(StoreError::Internal("workload name is required".to_string()));
        }
        let key = workload.key();
        if state.workloads.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("workload {key}")));
        }

        let now = state.now();
        let version = state.next_version();
        let mut created = workload;
        created.metadata.uid = Some(Uid::new());
        created.metadata.creation_timestamp = Some(now);
        created.metadata.deletion_timestamp = None;
        created.metadata.resource_version = Some(version);
        state.workloads.insert(key, created.clone());
        Ok(created)
    }

    async fn delete_workload(&self, reference: &ObjectReference) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.enter(StoreOp::DeleteWorkload)?;

        let key = reference.key();
        let matches = state
            .workloads
            .get(&key)
            .is_some_and(|w| w.metadata.uid == Some(reference.uid));
        if !matches {
            return Err(StoreError::NotFound(format!("workload {reference}")));
        }
        state.workloads.remove(&key);
        state.next_version();
        Ok(())
    }
}
