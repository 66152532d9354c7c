//! Severity levels and the reason vocabulary.

use serde::{Deserialize, Serialize};

// =============================================================================
// Reason Constants
// =============================================================================

/// All event reasons raised by the schedule controller.
pub mod reasons {
    // Active set bookkeeping
    pub const SAW_COMPLETED_WORKLOAD: &str = "SawCompletedWorkload";
    pub const MISSING_WORKLOAD: &str = "MissingWorkload";
    pub const UNEXPECTED_WORKLOAD: &str = "UnexpectedWorkload";
    pub const ADOPTED_WORKLOAD: &str = "AdoptedWorkload";

    // Schedule evaluation
    pub const INVALID_SCHEDULE: &str = "InvalidSchedule";
    pub const TOO_MANY_MISSED_TIMES: &str = "TooManyMissedTimes";
    pub const UNSUPPORTED_WORKLOAD: &str = "UnsupportedWorkload";
    pub const DEADLINE: &str = "Deadline";

    // Concurrency
    pub const ALREADY_ACTIVE: &str = "AlreadyActive";
    pub const OVERRIDE_POLICY: &str = "OverridePolicy";

    // Store mutations
    pub const SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
    pub const FAILED_CREATE: &str = "FailedCreate";
    pub const SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
    pub const FAILED_DELETE: &str = "FailedDelete";
}

// =============================================================================
// Severity
// =============================================================================

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Severity {
    /// Informational: normal progress or a self-healed anomaly.
    #[default]
    Normal,
    /// Something the owner of the schedule should look at.
    Warning,
}

impl Severity {
    /// Returns true for warnings.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Warning)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Normal => write!(f, "Normal"),
            Severity::Warning => write!(f, "Warning"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_serialization() {
        assert_eq!(serde_json::to_string(&Severity::Normal).unwrap(), "\"Normal\"");
        assert_eq!(
            serde_json::to_string(&Severity::Warning).unwrap(),
            "\"Warning\""
        );
    }
}
