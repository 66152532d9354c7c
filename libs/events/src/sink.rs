//! Event sinks.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::EventRecord;

/// Destination for events.
///
/// Implementations must not block and must swallow their own failures:
/// event delivery never influences a reconciliation decision.
pub trait EventSink: Send + Sync {
    fn record(&self, event: EventRecord);
}

/// Sink that writes events as structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: EventRecord) {
        if event.severity.is_warning() {
            warn!(object = %event.involved, reason = %event.reason, "{}", event.message);
        } else {
            info!(object = %event.involved, reason = %event.reason, "{}", event.message);
        }
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<EventRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events, oldest first.
    pub fn events(&self) -> Vec<EventRecord> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Reasons of all recorded events, oldest first.
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    /// Number of events recorded with the given reason.
    pub fn count(&self, reason: &str) -> usize {
        self.events().iter().filter(|e| e.reason == reason).count()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: EventRecord) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}
