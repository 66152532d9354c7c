//! Schedule manifest loading.
//!
//! The manifest is a TOML file with one `[[schedules]]` table per schedule:
//!
//! ```toml
//! [[schedules]]
//! name = "nightly-train"
//! namespace = "ml"
//! schedule = "0 2 * * *"
//! concurrency_policy = "Forbid"
//! history_limit = 5
//!
//! [schedules.template]
//! api_version = "kubeflow.org/v1"
//! kind = "PyTorchJob"
//!
//! [schedules.template.workload.spec.pytorchReplicaSpecs.Master]
//! replicas = 1
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use cadence_reconcile::{
    ConcurrencyPolicy, CronSchedule, MemoryStore, ObjectKey, ObjectMeta, ScheduleSpec,
    WorkloadTemplate,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleEntry {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub schedule: String,
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,
    #[serde(default)]
    pub suspend: bool,
    /// RFC 3339 timestamp.
    pub deadline: Option<String>,
    pub history_limit: Option<u32>,
    pub template: TemplateEntry,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateEntry {
    pub api_version: String,
    pub kind: String,
    pub workload: Option<toml::Table>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl ScheduleEntry {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// The schedule resource this entry declares.
    pub fn to_schedule(&self) -> Result<CronSchedule> {
        let deadline = self
            .deadline
            .as_deref()
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .with_context(|| format!("invalid deadline {raw:?}"))
            })
            .transpose()?;

        let workload = self
            .template
            .workload
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .context("failed to convert workload template")?;

        Ok(CronSchedule {
            metadata: ObjectMeta {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
                ..ObjectMeta::default()
            },
            spec: ScheduleSpec {
                schedule: self.schedule.clone(),
                template: WorkloadTemplate {
                    api_version: self.template.api_version.clone(),
                    kind: self.template.kind.clone(),
                    workload,
                },
                concurrency_policy: self.concurrency_policy,
                suspend: self.suspend,
                deadline,
                history_limit: self.history_limit,
            },
            ..CronSchedule::default()
        })
    }
}

pub fn parse(contents: &str) -> Result<Manifest> {
    let manifest: Manifest = toml::from_str(contents).context("invalid manifest TOML")?;

    let mut seen = BTreeSet::new();
    for entry in &manifest.schedules {
        if entry.name.is_empty() {
            anyhow::bail!("schedule name must not be empty");
        }
        if !seen.insert(entry.key()) {
            anyhow::bail!("duplicate schedule {}", entry.key());
        }
    }
    Ok(manifest)
}

pub fn load(path: &Path) -> Result<Manifest> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest: {}", path.display()))?;
    parse(&contents).with_context(|| format!("failed to load manifest: {}", path.display()))
}

/// Declares every schedule of `manifest` in `store`; returns their keys.
pub async fn apply(manifest: &Manifest, store: &MemoryStore) -> Result<Vec<ObjectKey>> {
    let mut keys = Vec::with_capacity(manifest.schedules.len());
    for entry in &manifest.schedules {
        let schedule = entry
            .to_schedule()
            .with_context(|| format!("schedule {}", entry.key()))?;
        keys.push(store.apply_schedule(schedule).await.key());
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[[schedules]]
name = "nightly-train"
namespace = "ml"
schedule = "0 2 * * *"
concurrency_policy = "Forbid"
history_limit = 5
deadline = "2030-01-01T00:00:00Z"

[schedules.template]
api_version = "kubeflow.org/v1"
kind = "PyTorchJob"

[schedules.template.workload.metadata.labels]
team = "research"

[schedules.template.workload.spec.pytorchReplicaSpecs.Master]
replicas = 1

[[schedules]]
name = "hourly-eval"
schedule = "@hourly"

[schedules.template]
api_version = "kubeflow.org/v1"
kind = "TFJob"
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = parse(MANIFEST).unwrap();
        assert_eq!(manifest.schedules.len(), 2);

        let nightly = manifest.schedules[0].to_schedule().unwrap();
        assert_eq!(nightly.key(), ObjectKey::new("ml", "nightly-train"));
        assert_eq!(nightly.spec.concurrency_policy, ConcurrencyPolicy::Forbid);
        assert_eq!(nightly.spec.history_limit, Some(5));
        assert!(nightly.spec.deadline.is_some());

        let workload = nightly.spec.template.workload.unwrap();
        assert_eq!(workload["metadata"]["labels"]["team"], "research");
        assert_eq!(workload["spec"]["pytorchReplicaSpecs"]["Master"]["replicas"], 1);

        let hourly = manifest.schedules[1].to_schedule().unwrap();
        assert_eq!(hourly.metadata.namespace, "default");
        assert_eq!(hourly.spec.concurrency_policy, ConcurrencyPolicy::Allow);
        assert!(hourly.spec.template.workload.is_none());
    }

    #[test]
    fn test_rejects_duplicates_and_unknown_fields() {
        let duplicate = r#"
[[schedules]]
name = "a"
schedule = "* * * * *"
template = { api_version = "kubeflow.org/v1", kind = "TFJob" }

[[schedules]]
name = "a"
schedule = "*/5 * * * *"
template = { api_version = "kubeflow.org/v1", kind = "TFJob" }
"#;
        assert!(parse(duplicate).is_err());

        let unknown = r#"
[[schedules]]
name = "a"
schedule = "* * * * *"
retries = 3
template = { api_version = "kubeflow.org/v1", kind = "TFJob" }
"#;
        assert!(parse(unknown).is_err());
    }

    #[test]
    fn test_bad_deadline_is_reported() {
        let manifest = parse(
            r#"
[[schedules]]
name = "a"
schedule = "* * * * *"
deadline = "tomorrow"
template = { api_version = "kubeflow.org/v1", kind = "TFJob" }
"#,
        )
        .unwrap();
        let err = manifest.schedules[0].to_schedule().unwrap_err();
        assert!(err.to_string().contains("invalid deadline"));
    }

    #[tokio::test]
    async fn test_apply_declares_schedules() {
        let store = MemoryStore::new();
        let keys = apply(&parse(MANIFEST).unwrap(), &store).await.unwrap();

        assert_eq!(
            keys,
            vec![
                ObjectKey::new("ml", "nightly-train"),
                ObjectKey::new("default", "hourly-eval")
            ]
        );
        let stored = store.schedule(&keys[0]).await.unwrap();
        assert!(stored.metadata.uid.is_some());
        assert!(stored.metadata.creation_timestamp.is_some());
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = load(Path::new("/nonexistent/cadence.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read manifest"));
    }
}
