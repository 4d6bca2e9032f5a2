//! The build report handed back to callers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use docvault_shared::{RunSummary, UnitFailure, UnitId};
use serde::Serialize;

/// Why a scheduled unit was not built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A task it depends on failed or was itself skipped for that reason.
    UpstreamFailure,
    /// The build was cancelled before the unit was dispatched.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUnit {
    pub unit_id: UnitId,
    #[serde(flatten)]
    pub failure: UnitFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedUnit {
    pub unit_id: UnitId,
    pub reason: SkipReason,
    /// The failed unit that caused an upstream skip.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UnitId>,
}

/// Overall classification of a finished build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    /// Every scheduled unit was rebuilt or deleted.
    Complete,
    /// Some units failed, were skipped, or the build was cancelled.
    Partial,
    /// Every attempted unit failed.
    Failed,
}

impl BuildOutcome {
    /// Process exit status for this outcome.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Complete => 0,
            Self::Partial => 2,
            Self::Failed => 3,
        }
    }
}

/// Result of one `build` invocation. Immutable once produced.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub started_at: DateTime<Utc>,
    pub wall_time: Duration,
    pub rebuilt: usize,
    pub skipped_cached: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub failures: Vec<FailedUnit>,
    pub skipped_units: Vec<SkippedUnit>,
    /// Dependency cycles present in the project.
    pub cycles: Vec<Vec<UnitId>>,
    /// Units whose stored record was damaged and ignored.
    pub corrupt_records: Vec<UnitId>,
    /// The store was unreadable and started empty.
    pub store_recovered: bool,
    /// Peak memory observed by the scheduler: the summed estimate of tasks
    /// holding a worker slot, including timed-out renders still running.
    /// Estimates, not process RSS.
    pub peak_admitted_memory: u64,
    pub cancelled: bool,
    /// Whole project rebuilt from scratch.
    pub full_build: bool,
}

impl BuildReport {
    pub fn outcome(&self) -> BuildOutcome {
        if self.failed == 0 && self.skipped == 0 && !self.cancelled {
            BuildOutcome::Complete
        } else if self.failed > 0 && self.rebuilt == 0 && self.deleted == 0 {
            BuildOutcome::Failed
        } else {
            BuildOutcome::Partial
        }
    }

    /// Counts persisted in the build history.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            rebuilt: self.rebuilt,
            skipped_cached: self.skipped_cached,
            failed: self.failed,
            skipped: self.skipped,
            deleted: self.deleted,
            cancelled: self.cancelled,
            full_build: self.full_build,
        }
    }
}
