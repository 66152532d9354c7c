//! Control loop orchestration.
//!
//! [`CronController`] runs one reconciliation cycle for one schedule: it
//! loads the schedule and its workloads, reconciles the active set and the
//! history, persists status, checks the terminal conditions, and creates
//! the workload for the due slot if policy allows.
//!
//! A cycle keeps no state between calls apart from the notice tracker,
//! which only decides whether a repeated user-facing event is emitted.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use cadence_events::{reasons, EventRecord, EventSink, Severity};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::active;
use crate::concurrency::{admit, effective_policy, Admission};
use crate::error::{ReconcileError, ReconcileResult, StoreError};
use crate::hash::InputDigest;
use crate::history::{self, FoldOutcome};
use crate::lifecycle::{KindRegistry, WorkloadKind, WorkloadObservation};
use crate::model::{CronSchedule, HistoryEntry, ObjectKey, ObjectReference, ScheduleStatus, Uid};
use crate::notice::NoticeTracker;
use crate::schedule::CronExpr;
use crate::store::ResourceStore;
use crate::workload::{build_workload, default_workload_name};

/// Where a schedule ended up after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// Scheduling normally.
    Active,
    /// `suspend` is set.
    Suspended,
    /// The deadline has passed; nothing more will be created.
    DeadlinePassed,
    /// Deletion has started; bookkeeping only.
    Deleting,
    /// The schedule no longer exists.
    Deleted,
    /// The cron expression does not parse.
    InvalidSchedule,
    /// The template names a kind with no registered implementation.
    UnsupportedWorkload,
}

impl CyclePhase {
    /// True once the driver can stop tracking the schedule.
    pub fn is_gone(&self) -> bool {
        matches!(self, CyclePhase::Deleted)
    }
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CyclePhase::Active => "active",
            CyclePhase::Suspended => "suspended",
            CyclePhase::DeadlinePassed => "deadline_passed",
            CyclePhase::Deleting => "deleting",
            CyclePhase::Deleted => "deleted",
            CyclePhase::InvalidSchedule => "invalid_schedule",
            CyclePhase::UnsupportedWorkload => "unsupported_workload",
        };
        write!(f, "{}", s)
    }
}

/// Result of a successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub phase: CyclePhase,

    /// When the next slot is due. `None` means nothing is scheduled and
    /// the driver should fall back to its periodic resync.
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    fn stopped(phase: CyclePhase) -> Self {
        Self {
            phase,
            requeue_after: None,
        }
    }

    fn active(requeue_after: Option<Duration>) -> Self {
        Self {
            phase: CyclePhase::Active,
            requeue_after,
        }
    }
}

/// Reconciles cron schedules against the resource store.
pub struct CronController {
    store: Arc<dyn ResourceStore>,
    events: Arc<dyn EventSink>,
    kinds: KindRegistry,
    notices: Mutex<NoticeTracker>,
}

impl CronController {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        events: Arc<dyn EventSink>,
        kinds: KindRegistry,
    ) -> Self {
        Self {
            store,
            events,
            kinds,
            notices: Mutex::new(NoticeTracker::default()),
        }
    }

    /// Replaces the notice tracker, e.g. to change the re-report interval.
    pub fn with_notice_tracker(mut self, tracker: NoticeTracker) -> Self {
        self.notices = Mutex::new(tracker);
        self
    }

    /// Runs one cycle for `key` at the current time.
    pub async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult<ReconcileOutcome> {
        self.reconcile_at(key, Utc::now()).await
    }

    /// Runs one cycle for `key` as of `now`.
    #[instrument(skip(self), fields(schedule = %key))]
    pub async fn reconcile_at(
        &self,
        key: &ObjectKey,
        now: DateTime<Utc>,
    ) -> ReconcileResult<ReconcileOutcome> {
        let subject = key.to_string();

        let schedule = match self.store.get_schedule(key).await {
            Ok(schedule) => schedule,
            Err(StoreError::NotFound(_)) => {
                debug!("schedule is gone");
                self.notices().forget(&subject);
                return Ok(ReconcileOutcome::stopped(CyclePhase::Deleted));
            }
            Err(e) => return Err(e.into()),
        };
        let owner = schedule
            .metadata
            .uid
            .ok_or_else(|| ReconcileError::MissingUid(key.clone()))?;

        let template = &schedule.spec.template;
        let Some(kind) = self.kinds.resolve(&template.api_version, &template.kind) else {
            let input = InputDigest::of_json(&serde_json::json!({
                "apiVersion": template.api_version,
                "kind": template.kind,
            }));
            let message = format!(
                "workload kind {}/{} is not supported",
                template.api_version, template.kind
            );
            self.notify(
                &schedule,
                Severity::Warning,
                reasons::UNSUPPORTED_WORKLOAD,
                &input,
                message,
            );
            return Ok(ReconcileOutcome::stopped(CyclePhase::UnsupportedWorkload));
        };
        self.notices().clear(&subject, reasons::UNSUPPORTED_WORKLOAD);

        // =========================================================================
        // Bookkeeping: active set, history, status
        // =========================================================================

        let observed = self.observe(&schedule, owner).await?;
        let mut saved = schedule.status.clone();

        let outcome =
            active::reconcile(self.store.as_ref(), &self.kinds, schedule, observed).await?;
        for signal in &outcome.signals {
            self.emit(&outcome.schedule, signal.severity(), signal.reason(), signal.message());
        }
        let mut schedule = outcome.schedule;
        if outcome.refreshed {
            saved = schedule.status.clone();
        }
        schedule.status.active = outcome.active;

        let eviction = self.compact_history(&mut schedule, &outcome.observed).await;
        self.persist(&mut schedule, &mut saved).await?;
        if let Some((failed, source)) = eviction {
            return Err(ReconcileError::EvictionFailed {
                schedule: key.clone(),
                failed,
                source,
            });
        }

        // =========================================================================
        // Terminal conditions
        // =========================================================================

        if schedule.metadata.deletion_timestamp.is_some() {
            debug!("schedule is being deleted");
            return Ok(ReconcileOutcome::stopped(CyclePhase::Deleting));
        }

        if schedule.spec.suspend {
            debug!("schedule is suspended");
            return Ok(ReconcileOutcome::stopped(CyclePhase::Suspended));
        }

        if let Some(deadline) = schedule.spec.deadline.filter(|d| now > *d) {
            let input = InputDigest::of_str(&deadline.to_rfc3339());
            let message = format!(
                "deadline {} has passed, no new workloads will be created",
                deadline.to_rfc3339()
            );
            self.notify(&schedule, Severity::Normal, reasons::DEADLINE, &input, message);
            return Ok(ReconcileOutcome::stopped(CyclePhase::DeadlinePassed));
        }

        // =========================================================================
        // Scheduling
        // =========================================================================

        let expr = match CronExpr::parse(&schedule.spec.schedule) {
            Ok(expr) => {
                self.notices().clear(&subject, reasons::INVALID_SCHEDULE);
                expr
            }
            Err(e) => {
                let input = InputDigest::of_str(&schedule.spec.schedule);
                self.notify(
                    &schedule,
                    Severity::Warning,
                    reasons::INVALID_SCHEDULE,
                    &input,
                    e.to_string(),
                );
                return Ok(ReconcileOutcome::stopped(CyclePhase::InvalidSchedule));
            }
        };
        let last_fired = schedule.status.last_schedule_time;
        let lower_bound = schedule.metadata.creation_timestamp.unwrap_or(now);
        let hint = expr.next_wakeup_delay(last_fired.unwrap_or(lower_bound), now);

        let due = match expr.due_time(last_fired, lower_bound, now) {
            Ok(Some(due)) => due,
            Ok(None) => {
                self.notices().clear(&subject, reasons::TOO_MANY_MISSED_TIMES);
                debug!(next_in = ?hint, "nothing due");
                return Ok(ReconcileOutcome::active(hint));
            }
            Err(e) => {
                let input = InputDigest::of_json(&serde_json::json!({
                    "schedule": schedule.spec.schedule,
                    "lastScheduleTime": schedule.status.last_schedule_time,
                }));
                let message =
                    format!("{e}; set a new schedule or clear the last schedule time to resume");
                self.notify(
                    &schedule,
                    Severity::Warning,
                    reasons::TOO_MANY_MISSED_TIMES,
                    &input,
                    message,
                );
                return Ok(ReconcileOutcome::active(hint));
            }
        };
        self.notices().clear(&subject, reasons::TOO_MANY_MISSED_TIMES);

        let declared = schedule.spec.concurrency_policy;
        let policy = effective_policy(declared, &schedule.spec.template);
        if policy != declared {
            if let Some(name) = schedule.spec.template.explicit_name() {
                let input = InputDigest::of_json(&serde_json::json!({
                    "name": name,
                    "policy": declared.to_string(),
                }));
                let message = format!(
                    "workload name {name} is fixed, \
                     concurrency policy {declared} is overridden to {policy}"
                );
                self.notify(&schedule, Severity::Normal, reasons::OVERRIDE_POLICY, &input, message);
            }
        }

        match admit(policy, &schedule.status.active) {
            Admission::Proceed => {}
            Admission::Skip => {
                let message = format!(
                    "not starting workload for {} because {} prior workload(s) are still active",
                    due.to_rfc3339(),
                    schedule.status.active.len()
                );
                self.emit(&schedule, Severity::Normal, reasons::ALREADY_ACTIVE, message);
                return Ok(ReconcileOutcome::active(hint));
            }
            Admission::ReplaceThenProceed(victims) => {
                self.replace(&mut schedule, &mut saved, victims).await?;
            }
        }

        // =========================================================================
        // Creation
        // =========================================================================

        let run = self.launch(&mut schedule, kind.as_ref(), owner, due).await?;

        let eviction = self.compact_history(&mut schedule, &run).await;
        self.persist(&mut schedule, &mut saved).await?;
        if let Some((failed, source)) = eviction {
            return Err(ReconcileError::EvictionFailed {
                schedule: key.clone(),
                failed,
                source,
            });
        }

        Ok(ReconcileOutcome::active(hint))
    }

    /// Classifies every workload the schedule controls. Workloads of kinds
    /// with no registered implementation are left out.
    async fn observe(
        &self,
        schedule: &CronSchedule,
        owner: Uid,
    ) -> ReconcileResult<Vec<WorkloadObservation>> {
        let workloads = self
            .store
            .list_workloads(&schedule.metadata.namespace, owner)
            .await?;

        let mut observed = Vec::with_capacity(workloads.len());
        for workload in &workloads {
            let Some(kind) = self.kinds.resolve(&workload.api_version, &workload.kind) else {
                debug!(
                    workload = %workload.metadata.name,
                    kind = %workload.kind,
                    "skipping workload of unknown kind"
                );
                continue;
            };
            if let Some(observation) = WorkloadObservation::observe(kind.as_ref(), workload) {
                observed.push(observation);
            }
        }
        Ok(observed)
    }

    /// Creates the workload for `due`, or resolves a name clash with an
    /// existing one. Returns the run to fold into history.
    async fn launch(
        &self,
        schedule: &mut CronSchedule,
        kind: &dyn WorkloadKind,
        owner: Uid,
        due: DateTime<Utc>,
    ) -> ReconcileResult<Vec<WorkloadObservation>> {
        let workload = match build_workload(schedule, kind, due) {
            Ok(workload) => workload,
            Err(e) => {
                self.emit(schedule, Severity::Warning, reasons::FAILED_CREATE, e.to_string());
                return Err(e);
            }
        };
        let name = workload.metadata.name.clone();

        let existing = match self.store.create_workload(workload).await {
            Ok(created) => {
                info!(workload = %name, scheduled_at = %due.to_rfc3339(), "created workload");
                self.emit(
                    schedule,
                    Severity::Normal,
                    reasons::SUCCESSFUL_CREATE,
                    format!("created workload {name}"),
                );
                let observation = WorkloadObservation::observe(kind, &created)
                    .ok_or_else(|| ReconcileError::MissingUid(created.key()))?;
                schedule.status.push_active(observation.reference.clone());
                schedule.status.advance_last_schedule_time(due);
                return Ok(vec![observation]);
            }
            Err(StoreError::AlreadyExists(_)) => {
                let key = ObjectKey::new(&schedule.metadata.namespace, &name);
                self.store.get_workload(&key).await?
            }
            Err(e) => {
                warn!(workload = %name, error = %e, "failed to create workload");
                self.emit(
                    schedule,
                    Severity::Warning,
                    reasons::FAILED_CREATE,
                    format!("error creating workload {name}: {e}"),
                );
                return Err(e.into());
            }
        };

        let same_kind = existing.api_version == kind.api_version() && existing.kind == kind.kind();
        let observation = WorkloadObservation::observe(kind, &existing).filter(|_| same_kind);
        let owned = same_kind && existing.metadata.is_controlled_by(owner);

        match observation {
            Some(observation) if schedule.status.is_active(observation.reference.uid) => {
                debug!(workload = %name, "workload already tracked");
                schedule.status.advance_last_schedule_time(due);
                Ok(vec![observation])
            }
            Some(observation) if owned && !observation.lifecycle.is_finished() => {
                info!(workload = %name, "adopting existing workload");
                self.emit(
                    schedule,
                    Severity::Normal,
                    reasons::ADOPTED_WORKLOAD,
                    format!("adopted existing workload {name}"),
                );
                schedule.status.push_active(observation.reference.clone());
                schedule.status.advance_last_schedule_time(due);
                Ok(vec![observation])
            }
            Some(observation)
                if owned && name == default_workload_name(&schedule.metadata.name, due) =>
            {
                debug!(workload = %name, "slot already ran");
                schedule.status.advance_last_schedule_time(due);
                Ok(vec![observation])
            }
            _ => {
                warn!(workload = %name, "workload name is taken");
                self.emit(
                    schedule,
                    Severity::Warning,
                    reasons::FAILED_CREATE,
                    format!("workload {name} already exists and is not tracked by this schedule"),
                );
                Err(ReconcileError::CreateConflict {
                    schedule: schedule.key(),
                    name,
                })
            }
        }
    }

    /// Deletes every victim and drops it from the active set, persisting
    /// before the new workload is created.
    async fn replace(
        &self,
        schedule: &mut CronSchedule,
        saved: &mut ScheduleStatus,
        victims: Vec<ObjectReference>,
    ) -> ReconcileResult<()> {
        for victim in victims {
            match self.store.delete_workload(&victim).await {
                Ok(()) => {
                    info!(workload = %victim.name, "deleted workload being replaced");
                    self.emit(
                        schedule,
                        Severity::Normal,
                        reasons::SUCCESSFUL_DELETE,
                        format!("deleted workload {}", victim.name),
                    );
                }
                Err(e) if e.is_not_found() => {
                    debug!(workload = %victim.name, "workload being replaced is already gone");
                }
                Err(e) => {
                    warn!(
                        workload = %victim.name,
                        error = %e,
                        "failed to delete workload being replaced"
                    );
                    self.emit(
                        schedule,
                        Severity::Warning,
                        reasons::FAILED_DELETE,
                        format!("error deleting workload {}: {e}", victim.name),
                    );
                    self.persist(schedule, saved).await?;
                    return Err(e.into());
                }
            }
            schedule.status.remove_active(victim.uid);
        }
        self.persist(schedule, saved).await
    }

    /// Folds `observed` into history and deletes the workloads of evicted
    /// entries. Entries whose deletion failed go back to the front of the
    /// history; the count and the first error are returned.
    async fn compact_history(
        &self,
        schedule: &mut CronSchedule,
        observed: &[WorkloadObservation],
    ) -> Option<(usize, StoreError)> {
        let FoldOutcome { history, evicted } = history::fold(
            std::mem::take(&mut schedule.status.history),
            observed,
            schedule.spec.history_limit,
        );

        let mut retained = Vec::new();
        let mut first_error = None;
        for entry in evicted {
            let reference = evicted_reference(&entry, &schedule.metadata.namespace, observed);
            match self.store.delete_workload(&reference).await {
                Ok(()) => {
                    debug!(workload = %reference.name, "deleted workload evicted from history");
                    self.emit(
                        schedule,
                        Severity::Normal,
                        reasons::SUCCESSFUL_DELETE,
                        format!("deleted workload {}", reference.name),
                    );
                    schedule.status.remove_active(entry.uid);
                }
                Err(e) if e.is_not_found() => {
                    schedule.status.remove_active(entry.uid);
                }
                Err(e) => {
                    warn!(
                        workload = %reference.name,
                        error = %e,
                        "failed to delete workload evicted from history"
                    );
                    self.emit(
                        schedule,
                        Severity::Warning,
                        reasons::FAILED_DELETE,
                        format!("error deleting workload {}: {e}", reference.name),
                    );
                    first_error.get_or_insert(e);
                    retained.push(entry);
                }
            }
        }

        let failed = retained.len();
        retained.extend(history);
        schedule.status.history = retained;
        first_error.map(|e| (failed, e))
    }

    /// Writes status if it differs from what was last read or written.
    async fn persist(
        &self,
        schedule: &mut CronSchedule,
        saved: &mut ScheduleStatus,
    ) -> ReconcileResult<()> {
        if schedule.status == *saved {
            return Ok(());
        }
        let updated = self.store.update_schedule_status(schedule).await?;
        debug!(resource_version = ?updated.metadata.resource_version, "status persisted");
        *saved = updated.status.clone();
        *schedule = updated;
        Ok(())
    }

    fn emit(
        &self,
        schedule: &CronSchedule,
        severity: Severity,
        reason: &str,
        message: impl Into<String>,
    ) {
        let event = EventRecord::builder()
            .involved(schedule.involved())
            .severity(severity)
            .reason(reason)
            .message(message)
            .build();
        match event {
            Ok(event) => self.events.record(event),
            Err(e) => warn!(error = %e, reason, "dropping malformed event"),
        }
    }

    /// Emits a user-facing notice unless the same input was reported
    /// recently.
    fn notify(
        &self,
        schedule: &CronSchedule,
        severity: Severity,
        reason: &str,
        input: &InputDigest,
        message: String,
    ) {
        let report = self
            .notices()
            .should_report(&schedule.key().to_string(), reason, input);
        if report {
            self.emit(schedule, severity, reason, message);
        } else {
            debug!(reason, input = %input, "notice already reported");
        }
    }

    fn notices(&self) -> MutexGuard<'_, NoticeTracker> {
        self.notices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reference used to delete the workload behind an evicted entry. Falls
/// back to the entry itself when the workload was not observed; the store
/// only needs the key and uid.
fn evicted_reference(
    entry: &HistoryEntry,
    namespace: &str,
    observed: &[WorkloadObservation],
) -> ObjectReference {
    observed
        .iter()
        .find(|o| o.reference.uid == entry.uid)
        .map(|o| o.reference.clone())
        .unwrap_or_else(|| ObjectReference {
            kind: entry.object.kind.clone(),
            api_version: entry.object.api_group.clone().unwrap_or_default(),
            namespace: namespace.to_string(),
            name: entry.object.name.clone(),
            uid: entry.uid,
        })
}
