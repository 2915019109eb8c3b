//! Quota reset audit trail.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of one quota reset execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Run in progress (or crashed before finalizing).
    Started,
    /// Every selected record was reset or skipped.
    Completed,
    /// Some records failed, some were reset.
    CompletedWithErrors,
    /// Nothing could be reset.
    Failed,
}

impl ExecutionStatus {
    /// Storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Completed => "COMPLETED",
            Self::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            Self::Failed => "FAILED",
        }
    }

    /// Parse a storage name; unknown names read as `Failed`.
    pub(crate) fn from_stored(s: &str) -> Self {
        match s {
            "STARTED" => Self::Started,
            "COMPLETED" => Self::Completed,
            "COMPLETED_WITH_ERRORS" => Self::CompletedWithErrors,
            _ => Self::Failed,
        }
    }

    /// Final status from per-record tallies.
    pub fn from_tally(successful: u64, failed: u64) -> Self {
        match (successful, failed) {
            (_, 0) => Self::Completed,
            (0, _) => Self::Failed,
            _ => Self::CompletedWithErrors,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a reset run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSource {
    /// The monthly boundary timer.
    Scheduled,
    /// The catch-up run when the scheduler starts.
    Startup,
    /// An operator-invoked reset.
    Manual {
        /// Who triggered it.
        operator: String,
    },
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => f.write_str("SCHEDULED"),
            Self::Startup => f.write_str("STARTUP"),
            Self::Manual { operator } => write!(f, "MANUAL:{}", operator),
        }
    }
}

/// One row per reset execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaResetAuditRecord {
    /// Audit row id.
    pub id: String,
    /// First day of the month being reset into.
    pub reset_date: NaiveDate,
    /// Month being reset into, `YYYY-MM`.
    pub month_year: String,
    /// Records selected.
    pub records_processed: u64,
    /// Records reset.
    pub records_successful: u64,
    /// Records that failed.
    pub records_failed: u64,
    /// Records skipped (unknown account or already reset).
    pub records_skipped: u64,
    /// Wall time of the run in milliseconds.
    pub duration_ms: i64,
    /// Trigger description.
    pub triggered_by: String,
    /// Execution status.
    pub status: ExecutionStatus,
    /// Crash message for failed runs.
    pub error_message: Option<String>,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end (None while `Started`).
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_tally() {
        assert_eq!(ExecutionStatus::from_tally(0, 0), ExecutionStatus::Completed);
        assert_eq!(ExecutionStatus::from_tally(5, 0), ExecutionStatus::Completed);
        assert_eq!(
            ExecutionStatus::from_tally(5, 1),
            ExecutionStatus::CompletedWithErrors
        );
        assert_eq!(ExecutionStatus::from_tally(0, 3), ExecutionStatus::Failed);
    }

    #[test]
    fn test_status_storage_names() {
        for status in [
            ExecutionStatus::Started,
            ExecutionStatus::Completed,
            ExecutionStatus::CompletedWithErrors,
            ExecutionStatus::Failed,
        ] {
            assert_eq!(ExecutionStatus::from_stored(status.as_str()), status);
        }
    }

    #[test]
    fn test_trigger_display() {
        assert_eq!(TriggerSource::Scheduled.to_string(), "SCHEDULED");
        assert_eq!(
            TriggerSource::Manual {
                operator: "ops@example.com".to_string()
            }
            .to_string(),
            "MANUAL:ops@example.com"
        );
    }
}
