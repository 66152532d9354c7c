//! Building workloads from a schedule's template.

use chrono::{DateTime, Utc};

use crate::error::{ReconcileError, ReconcileResult};
use crate::lifecycle::WorkloadKind;
use crate::model::{
    CronSchedule, ObjectMeta, OwnerReference, Workload, API_VERSION, SCHEDULE_KIND,
    SCHEDULE_NAME_LABEL,
};

/// Name given to the workload of the slot at `scheduled_at` when the
/// template does not fix one.
pub fn default_workload_name(schedule_name: &str, scheduled_at: DateTime<Utc>) -> String {
    format!("{}-{}", schedule_name, scheduled_at.timestamp())
}

/// Stamps a workload for the slot at `scheduled_at`.
///
/// Only the template's name, labels and annotations are carried over from
/// its metadata. The result is namespaced to the schedule, labelled with its
/// name and controlled by it.
pub fn build_workload(
    schedule: &CronSchedule,
    kind: &dyn WorkloadKind,
    scheduled_at: DateTime<Utc>,
) -> ReconcileResult<Workload> {
    let mut workload = kind.build_empty();

    if let Some(raw) = &schedule.spec.template.workload {
        let document = raw
            .as_object()
            .ok_or_else(|| ReconcileError::Template("workload must be an object".to_string()))?;

        if let Some(metadata) = document.get("metadata") {
            let metadata: ObjectMeta = serde_json::from_value(metadata.clone())
                .map_err(|e| ReconcileError::Template(format!("metadata: {e}")))?;
            workload.metadata.name = metadata.name;
            workload.metadata.labels = metadata.labels;
            workload.metadata.annotations = metadata.annotations;
        }
        if let Some(spec) = document.get("spec") {
            workload.spec = spec.clone();
        }
    }

    workload.metadata.generate_name.clear();
    if workload.metadata.name.is_empty() {
        workload.metadata.name = default_workload_name(&schedule.metadata.name, scheduled_at);
    }
    workload.metadata.namespace = schedule.metadata.namespace.clone();
    workload
        .metadata
        .labels
        .insert(SCHEDULE_NAME_LABEL.to_string(), schedule.metadata.name.clone());

    set_controller_reference(schedule, &mut workload)?;
    Ok(workload)
}

/// Makes `owner` the controlling owner of `workload`, replacing any other
/// controller reference.
pub fn set_controller_reference(
    owner: &CronSchedule,
    workload: &mut Workload,
) -> ReconcileResult<()> {
    let uid = owner
        .metadata
        .uid
        .ok_or_else(|| ReconcileError::MissingUid(owner.key()))?;

    let references = &mut workload.metadata.owner_references;
    references.retain(|r| !r.controller && r.uid != uid);
    references.push(OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: SCHEDULE_KIND.to_string(),
        name: owner.metadata.name.clone(),
        uid,
        controller: true,
    });
    Ok(())
}
