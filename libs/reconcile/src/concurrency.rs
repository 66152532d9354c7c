//! Concurrency policy enforcement.

use crate::model::{ConcurrencyPolicy, ObjectReference, WorkloadTemplate};

/// Decision for a due slot given what is still active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Create the new workload.
    Proceed,
    /// Do not create anything for this slot.
    Skip,
    /// Delete every listed workload, then create the new one.
    ReplaceThenProceed(Vec<ObjectReference>),
}

/// Decides whether a due slot may run.
pub fn admit(policy: ConcurrencyPolicy, active: &[ObjectReference]) -> Admission {
    match policy {
        ConcurrencyPolicy::Allow => Admission::Proceed,
        ConcurrencyPolicy::Forbid if active.is_empty() => Admission::Proceed,
        ConcurrencyPolicy::Forbid => Admission::Skip,
        ConcurrencyPolicy::Replace if active.is_empty() => Admission::Proceed,
        ConcurrencyPolicy::Replace => Admission::ReplaceThenProceed(active.to_vec()),
    }
}

/// Policy actually applied for `template`.
///
/// A template with a fixed workload name cannot run two instances side by
/// side, so it is always treated as `Forbid`.
pub fn effective_policy(
    declared: ConcurrencyPolicy,
    template: &WorkloadTemplate,
) -> ConcurrencyPolicy {
    if template.explicit_name().is_some() {
        ConcurrencyPolicy::Forbid
    } else {
        declared
    }
}
