//! Active-set reconciliation.
//!
//! The recorded active set is a denormalized view of which workloads are
//! still running. Each cycle it is checked against what the store reports:
//! finished workloads leave the set, vanished ones are dropped, and running
//! workloads the set does not know about are reported, never adopted.

use cadence_events::{reasons, Severity};
use tracing::{debug, info};

use crate::error::{ReconcileResult, StoreError};
use crate::lifecycle::{KindRegistry, WorkloadObservation};
use crate::model::{CronSchedule, ObjectReference};
use crate::store::ResourceStore;

/// Something noteworthy found while reconciling the active set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveSignal {
    /// A recorded workload has finished and was removed.
    Completed(ObjectReference),
    /// A recorded workload no longer exists and was removed.
    Missing(ObjectReference),
    /// A running workload is owned by the schedule but not recorded.
    Unexpected(ObjectReference),
}

impl ActiveSignal {
    pub fn reference(&self) -> &ObjectReference {
        match self {
            ActiveSignal::Completed(r)
            | ActiveSignal::Missing(r)
            | ActiveSignal::Unexpected(r) => r,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ActiveSignal::Completed(_) => reasons::SAW_COMPLETED_WORKLOAD,
            ActiveSignal::Missing(_) => reasons::MISSING_WORKLOAD,
            ActiveSignal::Unexpected(_) => reasons::UNEXPECTED_WORKLOAD,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ActiveSignal::Unexpected(_) => Severity::Warning,
            _ => Severity::Normal,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ActiveSignal::Completed(r) => format!("saw completed workload {}", r.name),
            ActiveSignal::Missing(r) => format!("active workload {} went missing", r.name),
            ActiveSignal::Unexpected(r) => format!(
                "saw a workload {} that the list of active workloads does not hold",
                r.name
            ),
        }
    }
}

/// Result of active-set reconciliation.
#[derive(Debug, Clone)]
pub struct ActiveSetOutcome {
    /// Baseline for the rest of the cycle. Replaced by the store's copy if
    /// the re-fetch showed the local one was stale.
    pub schedule: CronSchedule,

    /// The reconciled active set.
    pub active: Vec<ObjectReference>,

    /// Every observation, including workloads fetched in the second pass.
    pub observed: Vec<WorkloadObservation>,

    pub signals: Vec<ActiveSignal>,

    /// True if `schedule` came from the re-fetch.
    pub refreshed: bool,
}

/// Reconciles `schedule`'s active set against `observed`.
///
/// The schedule is re-fetched at most once per call. Any store error other
/// than not-found aborts.
pub async fn reconcile(
    store: &dyn ResourceStore,
    kinds: &KindRegistry,
    schedule: CronSchedule,
    observed: Vec<WorkloadObservation>,
) -> ReconcileResult<ActiveSetOutcome> {
    let key = schedule.key();
    let mut baseline = schedule;
    let mut refreshed = false;
    let mut authoritative: Option<CronSchedule> = None;

    'pass: loop {
        let mut active = baseline.status.active.clone();
        let mut signals = Vec::new();

        for observation in &observed {
            let uid = observation.reference.uid;
            let recorded = active.iter().any(|r| r.uid == uid);
            let finished = observation.lifecycle.is_finished();

            if !finished && !recorded {
                if !refreshed {
                    if authoritative.is_none() {
                        debug!(
                            schedule = %key,
                            workload = %observation.name(),
                            "re-fetching schedule"
                        );
                        authoritative = Some(store.get_schedule(&key).await?);
                    }
                    let recorded_upstream =
                        authoritative.as_ref().filter(|s| s.status.is_active(uid));
                    if let Some(fresh) = recorded_upstream {
                        info!(
                            schedule = %key,
                            "local copy was stale, restarting from the store's copy"
                        );
                        baseline = fresh.clone();
                        refreshed = true;
                        continue 'pass;
                    }
                }
                signals.push(ActiveSignal::Unexpected(observation.reference.clone()));
            } else if finished && recorded {
                active.retain(|r| r.uid != uid);
                signals.push(ActiveSignal::Completed(observation.reference.clone()));
            }
        }

        let mut observed = observed.clone();
        let unobserved: Vec<ObjectReference> = active
            .iter()
            .filter(|r| !observed.iter().any(|o| o.reference.uid == r.uid))
            .cloned()
            .collect();

        for reference in unobserved {
            match store.get_workload(&reference.key()).await {
                Ok(workload) if workload.metadata.uid == Some(reference.uid) => {
                    let observation = kinds
                        .resolve(&workload.api_version, &workload.kind)
                        .and_then(|kind| WorkloadObservation::observe(kind.as_ref(), &workload));
                    let Some(observation) = observation else {
                        debug!(
                            schedule = %key,
                            workload = %reference.name,
                            "cannot classify workload, keeping it active"
                        );
                        continue;
                    };
                    if observation.lifecycle.is_finished() {
                        active.retain(|r| r.uid != reference.uid);
                        signals.push(ActiveSignal::Completed(reference));
                    }
                    observed.push(observation);
                }
                // Same name, different object: the recorded one is gone.
                Ok(_) => {
                    active.retain(|r| r.uid != reference.uid);
                    signals.push(ActiveSignal::Missing(reference));
                }
                Err(StoreError::NotFound(_)) => {
                    active.retain(|r| r.uid != reference.uid);
                    signals.push(ActiveSignal::Missing(reference));
                }
                Err(e) => return Err(e.into()),
            }
        }

        return Ok(ActiveSetOutcome {
            schedule: baseline,
            active,
            observed,
            signals,
            refreshed,
        });
    }
}
