//! Process and stage state machines.

use serde::{Deserialize, Serialize};

/// Status of one process (job) execution.
///
/// Transitions: NOT_STARTED → SCHEDULED → RUNNING → {FINISHED | ERROR |
/// CANCELED}. SKIPPED is reached directly from NOT_STARTED without ever
/// running; NOT_REQUIRED marks jobs with no external step. A process is never
/// SCHEDULED and RUNNING at the same time: both are statuses of the same
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    NotStarted,
    Scheduled,
    Running,
    Finished,
    Error,
    Canceled,
    Skipped,
    NotRequired,
}

impl ProcessStatus {
    /// Whether the process is waiting for or bound to a worker.
    pub fn is_active(self) -> bool {
        matches!(self, ProcessStatus::Scheduled | ProcessStatus::Running)
    }

    /// Whether the process counts as completed for advancing a stage.
    pub fn is_complete(self) -> bool {
        matches!(
            self,
            ProcessStatus::Finished | ProcessStatus::Skipped | ProcessStatus::NotRequired
        )
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessStatus::NotStarted => "not_started",
            ProcessStatus::Scheduled => "scheduled",
            ProcessStatus::Running => "running",
            ProcessStatus::Finished => "finished",
            ProcessStatus::Error => "error",
            ProcessStatus::Canceled => "canceled",
            ProcessStatus::Skipped => "skipped",
            ProcessStatus::NotRequired => "not_required",
        };
        write!(f, "{}", s)
    }
}

/// Status of a stage, the aggregate of its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    NotStarted,
    Running,
    Finished,
    Error,
    Canceled,
}

impl StageStatus {
    /// Derives the aggregate status from a stage's process statuses.
    ///
    /// ERROR dominates, then an explicit CANCELED, then RUNNING while any
    /// job is active; FINISHED once every job is complete.
    pub fn aggregate(statuses: &[ProcessStatus]) -> StageStatus {
        if statuses.iter().any(|s| *s == ProcessStatus::Error) {
            return StageStatus::Error;
        }
        if statuses.iter().any(|s| *s == ProcessStatus::Canceled) {
            return StageStatus::Canceled;
        }
        if statuses.iter().any(|s| s.is_active()) {
            return StageStatus::Running;
        }
        if !statuses.is_empty() && statuses.iter().all(|s| s.is_complete()) {
            return StageStatus::Finished;
        }
        if statuses.iter().all(|s| *s == ProcessStatus::NotStarted) {
            return StageStatus::NotStarted;
        }
        // Some jobs complete, none active: a partially executed stage.
        StageStatus::Running
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::NotStarted => "not_started",
            StageStatus::Running => "running",
            StageStatus::Finished => "finished",
            StageStatus::Error => "error",
            StageStatus::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}
