//! Event record - a single human-readable event about a resource.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EventError, Severity};

/// The object an event is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvolvedObject {
    pub kind: String,
    pub api_version: String,
    pub namespace: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl std::fmt::Display for InvolvedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// When the event was raised.
    pub occurred_at: DateTime<Utc>,

    /// The object the event is about.
    pub involved: InvolvedObject,

    /// Normal or Warning.
    #[serde(rename = "type")]
    pub severity: Severity,

    /// Machine-readable reason, one of [`crate::reasons`].
    pub reason: String,

    /// Human-readable message.
    pub message: String,
}

impl EventRecord {
    /// Creates a new event record builder.
    pub fn builder() -> EventRecordBuilder {
        EventRecordBuilder::new()
    }
}

/// Builder for constructing event records.
#[derive(Debug, Default)]
pub struct EventRecordBuilder {
    occurred_at: Option<DateTime<Utc>>,
    involved: Option<InvolvedObject>,
    severity: Severity,
    reason: Option<String>,
    message: Option<String>,
}

impl EventRecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn involved(mut self, involved: InvolvedObject) -> Self {
        self.involved = Some(involved);
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Builds the event record.
    ///
    /// `occurred_at` defaults to now; `involved` and `reason` are required.
    pub fn build(self) -> Result<EventRecord, EventError> {
        Ok(EventRecord {
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            involved: self.involved.ok_or(EventError::MissingField("involved"))?,
            severity: self.severity,
            reason: self.reason.ok_or(EventError::MissingField("reason"))?,
            message: self.message.unwrap_or_default(),
        })
    }
}
