//! Resource model: schedule resources, workloads, and references between them.
//!
//! Field names serialize as camelCase so the persisted status sub-document
//! reads `active`, `history`, `lastScheduleTime`.

use std::collections::BTreeMap;

use cadence_events::InvolvedObject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// API version of the schedule resource.
pub const API_VERSION: &str = "cadence.dev/v1alpha1";

/// Kind of the schedule resource.
pub const SCHEDULE_KIND: &str = "CronSchedule";

/// Label stamped on every workload created for a schedule.
pub const SCHEDULE_NAME_LABEL: &str = "cadence.dev/schedule-name";

// =============================================================================
// Identity
// =============================================================================

/// Store-assigned unique identifier of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(Uuid);

impl Uid {
    /// Generates a fresh random uid.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Uid {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Namespace + name of an object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Back-reference from an owned object to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: Uid,
    #[serde(default)]
    pub controller: bool,
}

/// Object metadata shared by schedules and workloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub generate_name: String,

    pub namespace: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uid>,

    /// Optimistic-concurrency token; bumped by the store on every write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    /// The controlling owner, if any.
    pub fn controller(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|o| o.controller)
    }

    /// Returns true if `owner` is the controlling owner of this object.
    pub fn is_controlled_by(&self, owner: Uid) -> bool {
        self.controller().is_some_and(|o| o.uid == owner)
    }
}

/// Full reference to a workload (the element type of the active set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,
    pub api_version: String,
    pub namespace: String,
    pub name: String,
    pub uid: Uid,
}

impl ObjectReference {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }
}

impl std::fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Namespace-local typed reference stored in history entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedLocalReference {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub name: String,
}

// =============================================================================
// Schedule Resource
// =============================================================================

/// How a due time is handled while earlier workloads are still active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConcurrencyPolicy {
    /// Run concurrently with whatever is active.
    #[default]
    Allow,
    /// Skip the run while anything is active.
    Forbid,
    /// Delete everything active, then run.
    Replace,
}

impl std::fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConcurrencyPolicy::Allow => write!(f, "Allow"),
            ConcurrencyPolicy::Forbid => write!(f, "Forbid"),
            ConcurrencyPolicy::Replace => write!(f, "Replace"),
        }
    }
}

/// Template a workload is stamped from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadTemplate {
    pub api_version: String,
    pub kind: String,

    /// Raw workload document (`metadata` + `spec`), kind-specific.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<serde_json::Value>,
}

impl WorkloadTemplate {
    /// Explicit `metadata.name` in the raw workload, if one is set.
    pub fn explicit_name(&self) -> Option<&str> {
        self.workload
            .as_ref()?
            .pointer("/metadata/name")?
            .as_str()
            .filter(|name| !name.is_empty())
    }
}

/// Desired state of a schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    /// Cron expression, e.g. `*/5 * * * *`.
    pub schedule: String,

    pub template: WorkloadTemplate,

    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,

    #[serde(default)]
    pub suspend: bool,

    /// No new workloads are created after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,

    /// Number of history entries to retain; unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<u32>,
}

/// One past or ongoing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub uid: Uid,
    pub object: TypedLocalReference,
    pub status: LifecyclePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

/// Recorded state of a schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active: Vec<ObjectReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,
}

impl ScheduleStatus {
    pub fn is_active(&self, uid: Uid) -> bool {
        self.active.iter().any(|r| r.uid == uid)
    }

    /// Removes `uid` from the active set; returns true if it was present.
    pub fn remove_active(&mut self, uid: Uid) -> bool {
        let before = self.active.len();
        self.active.retain(|r| r.uid != uid);
        self.active.len() != before
    }

    /// Appends `reference` unless its uid is already tracked.
    pub fn push_active(&mut self, reference: ObjectReference) {
        if !self.is_active(reference.uid) {
            self.active.push(reference);
        }
    }

    /// Advances the last schedule time; never moves it backwards.
    pub fn advance_last_schedule_time(&mut self, at: DateTime<Utc>) {
        if self.last_schedule_time.is_none_or(|last| at > last) {
            self.last_schedule_time = Some(at);
        }
    }
}

/// The schedule resource: spec plus recorded status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronSchedule {
    pub metadata: ObjectMeta,
    pub spec: ScheduleSpec,
    #[serde(default)]
    pub status: ScheduleStatus,
}

impl CronSchedule {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Object this schedule's events attach to.
    pub fn involved(&self) -> InvolvedObject {
        InvolvedObject {
            kind: SCHEDULE_KIND.to_string(),
            api_version: API_VERSION.to_string(),
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.map(|uid| uid.to_string()),
        }
    }
}

// =============================================================================
// Workloads
// =============================================================================

/// Lifecycle vocabulary shared by every workload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LifecyclePhase {
    #[default]
    Created,
    Running,
    Restarting,
    Succeeded,
    Failed,
}

impl LifecyclePhase {
    /// Only Succeeded and Failed are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecyclePhase::Created => "Created",
            LifecyclePhase::Running => "Running",
            LifecyclePhase::Restarting => "Restarting",
            LifecyclePhase::Succeeded => "Succeeded",
            LifecyclePhase::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A condition reported by a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadCondition {
    #[serde(rename = "type")]
    pub kind: LifecyclePhase,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl WorkloadCondition {
    /// A condition with status `True`.
    pub fn reported(kind: LifecyclePhase, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            status: ConditionStatus::True,
            reason: String::new(),
            message: String::new(),
            last_transition_time: Some(at),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkloadStatus {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<WorkloadCondition>,
}

/// A workload object in the store. Opaque beyond metadata and conditions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: WorkloadStatus,
}

impl Workload {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Full reference; `None` until the store has assigned a uid.
    pub fn reference(&self) -> Option<ObjectReference> {
        Some(ObjectReference {
            kind: self.kind.clone(),
            api_version: self.api_version.clone(),
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid?,
        })
    }
}
