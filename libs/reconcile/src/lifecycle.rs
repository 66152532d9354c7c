//! Workload lifecycle classification and the workload kind registry.
//!
//! The core never interprets workload internals. Each supported kind
//! provides a [`WorkloadKind`] that maps its reported conditions onto the
//! shared [`LifecyclePhase`] vocabulary, and the [`KindRegistry`] resolves
//! a template's `(apiVersion, kind)` to that implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::model::{
    ConditionStatus, LifecyclePhase, ObjectReference, Workload, WorkloadCondition,
};

/// API version of the Kubeflow training job kinds registered by default.
pub const KUBEFLOW_API_VERSION: &str = "kubeflow.org/v1";

/// Where a workload is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Still running (or not started yet) in the given phase.
    Unfinished(LifecyclePhase),
    /// Reached Succeeded or Failed.
    Finished {
        outcome: LifecyclePhase,
        at: Option<DateTime<Utc>>,
    },
}

impl Lifecycle {
    pub fn is_finished(&self) -> bool {
        matches!(self, Lifecycle::Finished { .. })
    }

    pub fn phase(&self) -> LifecyclePhase {
        match self {
            Lifecycle::Unfinished(phase) => *phase,
            Lifecycle::Finished { outcome, .. } => *outcome,
        }
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Lifecycle::Unfinished(_) => None,
            Lifecycle::Finished { at, .. } => *at,
        }
    }
}

/// Maps reported conditions to a lifecycle.
///
/// Only conditions with status `True` count. Succeeded outranks Failed,
/// which outranks everything else; otherwise the latest reported condition
/// wins, and no condition at all means `Created`.
pub fn classify_conditions(conditions: &[WorkloadCondition]) -> Lifecycle {
    let reported = || {
        conditions
            .iter()
            .filter(|c| c.status == ConditionStatus::True)
    };

    for outcome in [LifecyclePhase::Succeeded, LifecyclePhase::Failed] {
        if let Some(condition) = reported().filter(|c| c.kind == outcome).last() {
            return Lifecycle::Finished {
                outcome,
                at: condition.last_transition_time,
            };
        }
    }

    Lifecycle::Unfinished(
        reported()
            .last()
            .map(|c| c.kind)
            .unwrap_or(LifecyclePhase::Created),
    )
}

/// Capability interface for one workload kind.
pub trait WorkloadKind: Send + Sync + std::fmt::Debug {
    fn api_version(&self) -> &str;

    fn kind(&self) -> &str;

    /// Classifies an observed object of this kind.
    fn classify(&self, workload: &Workload) -> Lifecycle;

    /// An empty object of this kind, ready to be filled from a template.
    fn build_empty(&self) -> Workload {
        Workload {
            api_version: self.api_version().to_string(),
            kind: self.kind().to_string(),
            ..Workload::default()
        }
    }
}

/// Job kinds that report lifecycle through a condition list
/// (Kubeflow `PyTorchJob`, `TFJob`, and friends).
#[derive(Debug, Clone)]
pub struct ConditionedJobKind {
    api_version: String,
    kind: String,
}

impl ConditionedJobKind {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }
}

impl WorkloadKind for ConditionedJobKind {
    fn api_version(&self) -> &str {
        &self.api_version
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn classify(&self, workload: &Workload) -> Lifecycle {
        classify_conditions(&workload.status.conditions)
    }
}

/// Lookup table from `(apiVersion, kind)` to its implementation.
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: BTreeMap<(String, String), Arc<dyn WorkloadKind>>,
}

impl KindRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Kubeflow training job kinds.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ConditionedJobKind::new(
            KUBEFLOW_API_VERSION,
            "PyTorchJob",
        )));
        registry.register(Arc::new(ConditionedJobKind::new(
            KUBEFLOW_API_VERSION,
            "TFJob",
        )));
        registry
    }

    /// Registers `kind`, replacing any previous registration.
    pub fn register(&mut self, kind: Arc<dyn WorkloadKind>) {
        self.kinds.insert(
            (kind.api_version().to_string(), kind.kind().to_string()),
            kind,
        );
    }

    pub fn resolve(&self, api_version: &str, kind: &str) -> Option<Arc<dyn WorkloadKind>> {
        self.kinds
            .get(&(api_version.to_string(), kind.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

/// A workload as seen during one cycle. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadObservation {
    pub reference: ObjectReference,
    pub lifecycle: Lifecycle,
    pub created: Option<DateTime<Utc>>,
}

impl WorkloadObservation {
    /// Classifies `workload`; `None` if the store has not assigned a uid.
    pub fn observe(kind: &dyn WorkloadKind, workload: &Workload) -> Option<Self> {
        Some(Self {
            reference: workload.reference()?,
            lifecycle: kind.classify(workload),
            created: workload.metadata.creation_timestamp,
        })
    }

    pub fn name(&self) -> &str {
        &self.reference.name
    }
}
