//! History compaction.
//!
//! Folds the workloads observed in a cycle into the recorded history, keeps
//! it ordered, and splits off the entries that exceed the retention limit.
//! Deleting the evicted workloads is left to the caller.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::lifecycle::WorkloadObservation;
use crate::model::{HistoryEntry, TypedLocalReference};

/// Result of folding observations into history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FoldOutcome {
    /// Retained entries, ordered.
    pub history: Vec<HistoryEntry>,

    /// Entries over the limit, oldest first. Their workloads must be deleted.
    pub evicted: Vec<HistoryEntry>,
}

/// Identity of a history entry: object name plus creation second.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistoryKey {
    pub name: String,
    pub created_secs: Option<i64>,
}

impl HistoryKey {
    pub fn new(name: &str, created: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.to_string(),
            created_secs: created.map(|t| t.timestamp()),
        }
    }

    pub fn of(entry: &HistoryEntry) -> Self {
        Self::new(&entry.object.name, entry.created)
    }
}

/// Builds a fresh entry for an observation.
pub fn entry_from_observation(observation: &WorkloadObservation) -> HistoryEntry {
    let reference = &observation.reference;
    HistoryEntry {
        uid: reference.uid,
        object: TypedLocalReference {
            kind: reference.kind.clone(),
            api_group: api_group(&reference.api_version),
            name: reference.name.clone(),
        },
        status: observation.lifecycle.phase(),
        created: observation.created,
        finished: observation.lifecycle.finished_at(),
    }
}

/// Group part of an `apiVersion`; `None` for the core group (`v1`).
fn api_group(api_version: &str) -> Option<String> {
    api_version
        .split_once('/')
        .map(|(group, _)| group.to_string())
}

/// Merges `observed` into `history` and applies `limit`.
///
/// An observation matching an existing entry updates only its uid, status
/// and (once) its finished time. Unmatched observations are appended.
pub fn fold(
    mut history: Vec<HistoryEntry>,
    observed: &[WorkloadObservation],
    limit: Option<u32>,
) -> FoldOutcome {
    let mut index: HashMap<HistoryKey, usize> = history
        .iter()
        .enumerate()
        .map(|(i, entry)| (HistoryKey::of(entry), i))
        .collect();

    for observation in observed {
        let key = HistoryKey::new(observation.name(), observation.created);
        match index.get(&key) {
            Some(&i) => {
                let entry = &mut history[i];
                entry.uid = observation.reference.uid;
                entry.status = observation.lifecycle.phase();
                if entry.finished.is_none() {
                    entry.finished = observation.lifecycle.finished_at();
                }
            }
            None => {
                history.push(entry_from_observation(observation));
                index.insert(key, history.len() - 1);
            }
        }
    }

    sort_history(&mut history);

    let evicted = match limit.map(|l| l as usize) {
        Some(limit) if history.len() > limit => {
            let overflow = history.len() - limit;
            history.drain(..overflow).collect()
        }
        _ => Vec::new(),
    };

    FoldOutcome { history, evicted }
}

/// Ascending by creation time, undated entries last, ties by name.
pub fn sort_history(history: &mut [HistoryEntry]) {
    history.sort_by(|a, b| {
        let by_created = match (a.created, b.created) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        };
        by_created.then_with(|| a.object.name.cmp(&b.object.name))
    });
}
