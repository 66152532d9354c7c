//! End-to-end reconciliation cycles against the in-memory store.

use std::sync::Arc;

use cadence_events::{reasons, MemorySink};
use cadence_reconcile::{
    ConcurrencyPolicy, CronController, CronSchedule, CyclePhase, KindRegistry, LifecyclePhase,
    MemoryStore, ObjectKey, ObjectMeta, OwnerReference, ReconcileError, ReconcileOutcome,
    ReconcileResult, ScheduleSpec, ScheduleStatus, StoreError, StoreOp, Workload,
    WorkloadCondition, WorkloadTemplate, API_VERSION, SCHEDULE_KIND,
};
use chrono::{DateTime, TimeZone, Utc};

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 8, h, m, 0).unwrap()
}

fn slot_name(slot: DateTime<Utc>) -> String {
    format!("nightly-{}", slot.timestamp())
}

fn spec(expr: &str) -> ScheduleSpec {
    ScheduleSpec {
        schedule: expr.to_string(),
        template: WorkloadTemplate {
            api_version: "kubeflow.org/v1".to_string(),
            kind: "PyTorchJob".to_string(),
            workload: Some(serde_json::json!({
                "metadata": { "labels": { "team": "research" } },
                "spec": { "pytorchReplicaSpecs": { "Master": { "replicas": 1 } } }
            })),
        },
        ..ScheduleSpec::default()
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    events: Arc<MemorySink>,
    controller: CronController,
    key: ObjectKey,
}

impl Harness {
    async fn new(spec: ScheduleSpec, created: DateTime<Utc>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(MemorySink::new());
        store.set_time(created).await;
        let schedule = store
            .apply_schedule(CronSchedule {
                metadata: ObjectMeta {
                    name: "nightly".to_string(),
                    namespace: "ml".to_string(),
                    ..ObjectMeta::default()
                },
                spec,
                ..CronSchedule::default()
            })
            .await;
        let controller = CronController::new(
            store.clone(),
            events.clone(),
            KindRegistry::with_defaults(),
        );
        Self {
            store,
            events,
            controller,
            key: schedule.key(),
        }
    }

    async fn cycle(&self, now: DateTime<Utc>) -> ReconcileResult<ReconcileOutcome> {
        self.store.set_time(now).await;
        self.controller.reconcile_at(&self.key, now).await
    }

    async fn schedule(&self) -> CronSchedule {
        self.store.schedule(&self.key).await.unwrap()
    }

    async fn status(&self) -> ScheduleStatus {
        self.schedule().await.status
    }

    async fn workload_names(&self) -> Vec<String> {
        self.store
            .workloads()
            .await
            .into_iter()
            .map(|w| w.metadata.name)
            .collect()
    }

    async fn finish(&self, name: &str, outcome: LifecyclePhase, when: DateTime<Utc>) {
        self.store
            .modify_workload(&ObjectKey::new("ml", name), |w| {
                w.status
                    .conditions
                    .push(WorkloadCondition::reported(outcome, when))
            })
            .await
            .unwrap();
    }

    async fn update_spec(&self, f: impl FnOnce(&mut ScheduleSpec)) {
        self.store
            .modify_schedule(&self.key, |s| f(&mut s.spec))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_creates_workload_for_due_slot() {
    let h = Harness::new(spec("*/5 * * * *"), at(11, 58)).await;

    let outcome = h.cycle(at(12, 1)).await.unwrap();

    assert_eq!(outcome.phase, CyclePhase::Active);
    assert_eq!(outcome.requeue_after, Some(std::time::Duration::from_secs(4 * 60)));
    assert_eq!(h.workload_names().await, vec![slot_name(at(12, 0))]);

    let status = h.status().await;
    assert_eq!(status.active.len(), 1);
    assert_eq!(status.active[0].name, slot_name(at(12, 0)));
    assert_eq!(status.last_schedule_time, Some(at(12, 0)));
    assert_eq!(status.history.len(), 1);
    assert_eq!(status.history[0].status, LifecyclePhase::Created);
    assert_eq!(h.events.count(reasons::SUCCESSFUL_CREATE), 1);

    let workloads = h.store.workloads().await;
    let workload = &workloads[0];
    assert_eq!(workload.metadata.labels["team"], "research");
    assert_eq!(workload.metadata.labels["cadence.dev/schedule-name"], "nightly");
    assert!(workload
        .metadata
        .is_controlled_by(h.schedule().await.metadata.uid.unwrap()));
}

#[tokio::test]
async fn test_second_cycle_is_idempotent() {
    let h = Harness::new(spec("*/5 * * * *"), at(11, 58)).await;

    h.cycle(at(12, 1)).await.unwrap();
    let first = h.status().await;
    let writes = h.store.calls(StoreOp::UpdateScheduleStatus).await;

    h.cycle(at(12, 1)).await.unwrap();
    h.cycle(at(12, 3)).await.unwrap();

    assert_eq!(h.status().await, first);
    assert_eq!(h.store.calls(StoreOp::UpdateScheduleStatus).await, writes);
    assert_eq!(h.store.calls(StoreOp::CreateWorkload).await, 1);
}

#[tokio::test]
async fn test_backlog_collapses_into_one_run() {
    let h = Harness::new(spec("*/5 * * * *"), at(9, 0)).await;
    h.store
        .modify_schedule(&h.key, |s| s.status.last_schedule_time = Some(at(10, 0)))
        .await
        .unwrap();

    h.cycle(at(12, 0)).await.unwrap();

    assert_eq!(h.workload_names().await, vec![slot_name(at(12, 0))]);
    assert_eq!(h.status().await.last_schedule_time, Some(at(12, 0)));
}

#[tokio::test]
async fn test_too_many_missed_creates_nothing_and_warns_once() {
    let h = Harness::new(spec("* * * * *"), at(10, 0)).await;

    let outcome = h.cycle(at(11, 41)).await.unwrap();
    h.cycle(at(11, 41)).await.unwrap();

    assert_eq!(outcome.phase, CyclePhase::Active);
    assert!(outcome.requeue_after.is_some());
    assert!(h.workload_names().await.is_empty());
    assert_eq!(h.events.count(reasons::TOO_MANY_MISSED_TIMES), 1);
    assert!(h.status().await.last_schedule_time.is_none());
}

#[tokio::test]
async fn test_forbid_skips_while_active() {
    let mut s = spec("*/5 * * * *");
    s.concurrency_policy = ConcurrencyPolicy::Forbid;
    let h = Harness::new(s, at(11, 58)).await;

    h.cycle(at(12, 1)).await.unwrap();
    h.cycle(at(12, 6)).await.unwrap();

    assert_eq!(h.workload_names().await.len(), 1);
    assert_eq!(h.events.count(reasons::ALREADY_ACTIVE), 1);
    assert_eq!(h.status().await.last_schedule_time, Some(at(12, 0)));

    // Once the first run finishes the pending slot fires.
    h.finish(&slot_name(at(12, 0)), LifecyclePhase::Succeeded, at(12, 6)).await;
    h.cycle(at(12, 7)).await.unwrap();

    let status = h.status().await;
    assert_eq!(status.active.len(), 1);
    assert_eq!(status.active[0].name, slot_name(at(12, 5)));
    assert_eq!(h.events.count(reasons::SAW_COMPLETED_WORKLOAD), 1);
}

#[tokio::test]
async fn test_replace_leaves_only_new_workload_active() {
    let mut s = spec("*/5 * * * *");
    s.concurrency_policy = ConcurrencyPolicy::Replace;
    let h = Harness::new(s, at(11, 58)).await;

    h.cycle(at(12, 1)).await.unwrap();
    h.cycle(at(12, 6)).await.unwrap();

    let status = h.status().await;
    assert_eq!(status.active.len(), 1);
    assert_eq!(status.active[0].name, slot_name(at(12, 5)));
    assert_eq!(h.workload_names().await, vec![slot_name(at(12, 5))]);
    assert_eq!(h.events.count(reasons::SUCCESSFUL_DELETE), 1);
}

#[tokio::test]
async fn test_replace_delete_failure_aborts_before_create() {
    let mut s = spec("*/5 * * * *");
    s.concurrency_policy = ConcurrencyPolicy::Replace;
    let h = Harness::new(s, at(11, 58)).await;

    h.cycle(at(12, 1)).await.unwrap();
    h.store
        .fail_next(StoreOp::DeleteWorkload, StoreError::Unavailable("down".into()))
        .await;

    let err = h.cycle(at(12, 6)).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(h.workload_names().await, vec![slot_name(at(12, 0))]);
    assert_eq!(h.store.calls(StoreOp::CreateWorkload).await, 1);
    assert_eq!(h.events.count(reasons::FAILED_DELETE), 1);

    // The retry completes the replacement.
    h.cycle(at(12, 6)).await.unwrap();
    assert_eq!(h.workload_names().await, vec![slot_name(at(12, 5))]);
}

#[tokio::test]
async fn test_history_limit_evicts_oldest_run() {
    let mut s = spec("*/5 * * * *");
    s.history_limit = Some(3);
    let h = Harness::new(s, at(11, 58)).await;

    for (slot, now) in [(at(12, 0), at(12, 1)), (at(12, 5), at(12, 6)), (at(12, 10), at(12, 11))] {
        h.cycle(now).await.unwrap();
        h.finish(&slot_name(slot), LifecyclePhase::Succeeded, now).await;
    }
    h.cycle(at(12, 16)).await.unwrap();

    let status = h.status().await;
    let names: Vec<_> = status.history.iter().map(|e| e.object.name.clone()).collect();
    assert_eq!(
        names,
        vec![slot_name(at(12, 5)), slot_name(at(12, 10)), slot_name(at(12, 15))]
    );
    assert_eq!(status.history[0].status, LifecyclePhase::Succeeded);
    assert_eq!(status.history[2].status, LifecyclePhase::Created);
    assert!(!h.workload_names().await.contains(&slot_name(at(12, 0))));
    assert_eq!(h.workload_names().await.len(), 3);
}

#[tokio::test]
async fn test_failed_eviction_is_retained_and_retried() {
    let mut s = spec("*/5 * * * *");
    s.history_limit = Some(1);
    let h = Harness::new(s, at(11, 58)).await;

    h.cycle(at(12, 1)).await.unwrap();
    h.finish(&slot_name(at(12, 0)), LifecyclePhase::Failed, at(12, 2)).await;
    h.store
        .fail_next(StoreOp::DeleteWorkload, StoreError::Unavailable("down".into()))
        .await;

    let err = h.cycle(at(12, 6)).await.unwrap_err();
    assert!(matches!(err, ReconcileError::EvictionFailed { failed: 1, .. }));
    assert!(err.is_retryable());

    let status = h.status().await;
    assert_eq!(status.history.len(), 2);
    assert_eq!(status.history[0].object.name, slot_name(at(12, 0)));
    assert_eq!(status.last_schedule_time, Some(at(12, 5)));

    h.cycle(at(12, 7)).await.unwrap();
    let status = h.status().await;
    assert_eq!(status.history.len(), 1);
    assert_eq!(status.history[0].object.name, slot_name(at(12, 5)));
    assert_eq!(h.workload_names().await, vec![slot_name(at(12, 5))]);
}

#[tokio::test]
async fn test_missing_active_workload_is_dropped() {
    let h = Harness::new(spec("*/5 * * * *"), at(11, 58)).await;
    h.cycle(at(12, 1)).await.unwrap();
    let before = h.status().await;

    h.store
        .remove_workload(&ObjectKey::new("ml", slot_name(at(12, 0))))
        .await
        .unwrap();
    h.cycle(at(12, 2)).await.unwrap();

    let after = h.status().await;
    assert!(after.active.is_empty());
    assert_eq!(after.history, before.history);
    assert_eq!(after.last_schedule_time, before.last_schedule_time);
    assert_eq!(h.events.count(reasons::MISSING_WORKLOAD), 1);
    assert!(h.workload_names().await.is_empty());
}

#[tokio::test]
async fn test_fixed_name_forbids_concurrency() {
    let mut s = spec("*/5 * * * *");
    s.template.workload = Some(serde_json::json!({ "metadata": { "name": "fixed" } }));
    let h = Harness::new(s, at(11, 58)).await;

    h.cycle(at(12, 1)).await.unwrap();
    h.cycle(at(12, 6)).await.unwrap();
    h.cycle(at(12, 11)).await.unwrap();

    assert_eq!(h.workload_names().await, vec!["fixed".to_string()]);
    assert_eq!(h.status().await.active.len(), 1);
    assert_eq!(h.events.count(reasons::OVERRIDE_POLICY), 1);
    assert_eq!(h.events.count(reasons::ALREADY_ACTIVE), 2);
}

#[tokio::test]
async fn test_suspended_schedule_creates_nothing() {
    let mut s = spec("*/5 * * * *");
    s.suspend = true;
    let h = Harness::new(s, at(11, 58)).await;

    let outcome = h.cycle(at(12, 1)).await.unwrap();

    assert_eq!(outcome.phase, CyclePhase::Suspended);
    assert_eq!(outcome.requeue_after, None);
    assert!(h.workload_names().await.is_empty());

    h.update_spec(|s| s.suspend = false).await;
    assert_eq!(h.cycle(at(12, 2)).await.unwrap().phase, CyclePhase::Active);
    assert_eq!(h.workload_names().await.len(), 1);
}

#[tokio::test]
async fn test_deadline_stops_scheduling() {
    let mut s = spec("*/5 * * * *");
    s.deadline = Some(at(11, 59));
    let h = Harness::new(s, at(11, 58)).await;

    let outcome = h.cycle(at(12, 1)).await.unwrap();
    h.cycle(at(12, 6)).await.unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome {
            phase: CyclePhase::DeadlinePassed,
            requeue_after: None
        }
    );
    assert!(h.workload_names().await.is_empty());
    assert_eq!(h.events.count(reasons::DEADLINE), 1);
}

#[tokio::test]
async fn test_deleted_schedule_stops() {
    let h = Harness::new(spec("*/5 * * * *"), at(11, 58)).await;
    h.store.remove_schedule(&h.key).await.unwrap();

    let outcome = h.cycle(at(12, 1)).await.unwrap();
    assert_eq!(outcome.phase, CyclePhase::Deleted);
    assert!(outcome.phase.is_gone());
}

#[tokio::test]
async fn test_deleting_schedule_keeps_bookkeeping_only() {
    let h = Harness::new(spec("*/5 * * * *"), at(11, 58)).await;
    h.cycle(at(12, 1)).await.unwrap();
    h.finish(&slot_name(at(12, 0)), LifecyclePhase::Succeeded, at(12, 3)).await;
    h.store
        .modify_schedule(&h.key, |s| s.metadata.deletion_timestamp = Some(at(12, 4)))
        .await
        .unwrap();

    let outcome = h.cycle(at(12, 6)).await.unwrap();

    assert_eq!(outcome.phase, CyclePhase::Deleting);
    let status = h.status().await;
    assert!(status.active.is_empty());
    assert_eq!(status.history[0].status, LifecyclePhase::Succeeded);
    assert_eq!(h.store.calls(StoreOp::CreateWorkload).await, 1);
}

#[tokio::test]
async fn test_invalid_schedule_is_reported_once() {
    let h = Harness::new(spec("not a schedule"), at(11, 58)).await;

    let outcome = h.cycle(at(12, 1)).await.unwrap();
    h.cycle(at(12, 6)).await.unwrap();

    assert_eq!(outcome.phase, CyclePhase::InvalidSchedule);
    assert_eq!(outcome.requeue_after, None);
    assert_eq!(h.events.count(reasons::INVALID_SCHEDULE), 1);

    // A different bad expression is a new problem.
    h.update_spec(|s| s.schedule = "61 * * * *".to_string()).await;
    h.cycle(at(12, 7)).await.unwrap();
    assert_eq!(h.events.count(reasons::INVALID_SCHEDULE), 2);
}

#[tokio::test]
async fn test_unsupported_kind_stops() {
    let mut s = spec("*/5 * * * *");
    s.template.api_version = "batch/v1".to_string();
    s.template.kind = "Job".to_string();
    let h = Harness::new(s, at(11, 58)).await;

    let outcome = h.cycle(at(12, 1)).await.unwrap();
    h.cycle(at(12, 2)).await.unwrap();

    assert_eq!(outcome.phase, CyclePhase::UnsupportedWorkload);
    assert_eq!(h.events.count(reasons::UNSUPPORTED_WORKLOAD), 1);
    assert!(h.workload_names().await.is_empty());
}

#[tokio::test]
async fn test_unexpected_workload_is_not_adopted() {
    let h = Harness::new(spec("0 0 * * *"), at(11, 58)).await;
    let owner = h.schedule().await;

    let mut stray = Workload {
        api_version: "kubeflow.org/v1".to_string(),
        kind: "PyTorchJob".to_string(),
        ..Workload::default()
    };
    stray.metadata.name = "stray".to_string();
    stray.metadata.namespace = "ml".to_string();
    stray.metadata.owner_references.push(OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: SCHEDULE_KIND.to_string(),
        name: "nightly".to_string(),
        uid: owner.metadata.uid.unwrap(),
        controller: true,
    });
    h.store.put_workload(stray).await;

    h.cycle(at(12, 1)).await.unwrap();

    let status = h.status().await;
    assert!(status.active.is_empty());
    assert_eq!(status.history.len(), 1);
    assert_eq!(h.events.count(reasons::UNEXPECTED_WORKLOAD), 1);
}

#[tokio::test]
async fn test_lost_status_write_is_recovered_by_adoption() {
    let h = Harness::new(spec("*/5 * * * *"), at(11, 58)).await;
    h.store
        .fail_next(StoreOp::UpdateScheduleStatus, StoreError::Conflict("stale".into()))
        .await;

    let err = h.cycle(at(12, 1)).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store(StoreError::Conflict(_))));
    assert!(h.status().await.active.is_empty());

    h.cycle(at(12, 2)).await.unwrap();

    let status = h.status().await;
    assert_eq!(h.workload_names().await, vec![slot_name(at(12, 0))]);
    assert_eq!(status.active.len(), 1);
    assert_eq!(status.last_schedule_time, Some(at(12, 0)));
    assert_eq!(h.events.count(reasons::ADOPTED_WORKLOAD), 1);
}

#[tokio::test]
async fn test_name_taken_by_foreign_workload_conflicts() {
    let h = Harness::new(spec("*/5 * * * *"), at(11, 58)).await;
    let mut foreign = Workload {
        api_version: "kubeflow.org/v1".to_string(),
        kind: "PyTorchJob".to_string(),
        ..Workload::default()
    };
    foreign.metadata.name = slot_name(at(12, 0));
    foreign.metadata.namespace = "ml".to_string();
    h.store.put_workload(foreign).await;

    let err = h.cycle(at(12, 1)).await.unwrap_err();

    assert!(matches!(err, ReconcileError::CreateConflict { .. }));
    assert!(err.is_retryable());
    assert_eq!(h.events.count(reasons::FAILED_CREATE), 1);
    assert!(h.status().await.last_schedule_time.is_none());
}

#[tokio::test]
async fn test_store_outage_is_retryable() {
    let h = Harness::new(spec("*/5 * * * *"), at(11, 58)).await;
    h.store
        .fail_next(StoreOp::ListWorkloads, StoreError::Unavailable("down".into()))
        .await;

    assert!(h.cycle(at(12, 1)).await.unwrap_err().is_retryable());
    assert!(h.cycle(at(12, 1)).await.is_ok());
    assert_eq!(h.workload_names().await.len(), 1);
}

#[tokio::test]
async fn test_every_schedule_steps_from_last_fired() {
    let h = Harness::new(spec("@every 30m"), at(10, 0)).await;

    let outcome = h.cycle(at(10, 45)).await.unwrap();
    assert_eq!(outcome.requeue_after, Some(std::time::Duration::from_secs(15 * 60)));
    assert_eq!(h.status().await.last_schedule_time, Some(at(10, 30)));

    h.cycle(at(11, 5)).await.unwrap();
    assert_eq!(h.status().await.last_schedule_time, Some(at(11, 0)));
    assert_eq!(
        h.workload_names().await,
        vec![slot_name(at(10, 30)), slot_name(at(11, 0))]
    );
}
