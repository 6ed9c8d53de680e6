//! Task status and aggregation
//!
//! Tasks, stages and targets share one status vocabulary. A parent derives
//! its status from the counts of its children:
//!
//! - all children finished or skipped: `finished` (`skipped` if none finished)
//! - any child failed and none pending: `failed`
//! - any child suspended and none failed: `suspended`
//! - otherwise: `pending`

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Lifecycle state of a task, stage or target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Not started yet
    #[default]
    New,
    Pending,
    Finished,
    Failed,
    Skipped,
    Suspended,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::New => "null",
            TaskStatus::Pending => "pending",
            TaskStatus::Finished => "finished",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Suspended => "suspended",
        }
    }

    /// Whether the status is final for the current run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Suspended
        )
    }

    /// Whether a run that ended in this status counts as successful
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Skipped)
    }

    /// Validates a transition. Terminal states may only restart as `pending`
    /// (a resumed run), and nothing moves back to `null`.
    pub fn transition(self, to: TaskStatus) -> Result<TaskStatus, DomainError> {
        let allowed = match (self, to) {
            (_, TaskStatus::New) => false,
            (TaskStatus::New, _) => true,
            (TaskStatus::Pending, _) => true,
            (from, TaskStatus::Pending) if from.is_terminal() => true,
            (from, to) => from == to,
        };
        if allowed {
            Ok(to)
        } else {
            Err(DomainError::InvalidState {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-status child counters of a parent task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: u64,
    pub pending: u64,
    pub finished: u64,
    pub failed: u64,
    pub skipped: u64,
    pub suspended: u64,
}

impl StatusCounts {
    /// Records a child that just entered `status`.
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::New => {}
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Finished => self.finished += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Skipped => self.skipped += 1,
            TaskStatus::Suspended => self.suspended += 1,
        }
    }

    /// Moves a child from `from` to `to`.
    pub fn transition(&mut self, from: TaskStatus, to: TaskStatus) {
        let slot = match from {
            TaskStatus::New => None,
            TaskStatus::Pending => Some(&mut self.pending),
            TaskStatus::Finished => Some(&mut self.finished),
            TaskStatus::Failed => Some(&mut self.failed),
            TaskStatus::Skipped => Some(&mut self.skipped),
            TaskStatus::Suspended => Some(&mut self.suspended),
        };
        if let Some(count) = slot {
            *count = count.saturating_sub(1);
        }
        self.record(to);
    }

    /// Children that reached a final state
    pub fn done(&self) -> u64 {
        self.finished + self.failed + self.skipped + self.suspended
    }

    /// Derives the parent status from the child counts.
    pub fn aggregate(&self) -> TaskStatus {
        let settled = self.finished + self.skipped;
        if self.pending == 0 && settled >= self.total {
            return if self.finished == 0 && self.skipped > 0 {
                TaskStatus::Skipped
            } else {
                TaskStatus::Finished
            };
        }
        if self.failed > 0 && self.pending == 0 {
            return TaskStatus::Failed;
        }
        if self.suspended > 0 && self.failed == 0 && self.pending == 0 {
            return TaskStatus::Suspended;
        }
        TaskStatus::Pending
    }

    pub fn merge(&mut self, other: &StatusCounts) {
        self.total += other.total;
        self.pending += other.pending;
        self.finished += other.finished;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.suspended += other.suspended;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(total: u64, statuses: &[TaskStatus]) -> StatusCounts {
        let mut c = StatusCounts {
            total,
            ..Default::default()
        };
        for s in statuses {
            c.record(*s);
        }
        c
    }

    #[test]
    fn all_finished_or_skipped_is_finished() {
        use TaskStatus::*;
        assert_eq!(counts(2, &[Finished, Skipped]).aggregate(), Finished);
        assert_eq!(counts(0, &[]).aggregate(), Finished);
        assert_eq!(counts(2, &[Skipped, Skipped]).aggregate(), Skipped);
    }

    #[test]
    fn failures_win_once_nothing_is_pending() {
        use TaskStatus::*;
        assert_eq!(counts(3, &[Finished, Failed, Pending]).aggregate(), Pending);
        assert_eq!(counts(3, &[Finished, Failed, Suspended]).aggregate(), Failed);
    }

    #[test]
    fn suspension_without_failures_is_suspended() {
        use TaskStatus::*;
        assert_eq!(counts(2, &[Finished, Suspended]).aggregate(), Suspended);
    }

    #[test]
    fn transition_moves_counts() {
        let mut c = counts(1, &[TaskStatus::Pending]);
        c.transition(TaskStatus::Pending, TaskStatus::Finished);
        assert_eq!(c.pending, 0);
        assert_eq!(c.finished, 1);
        assert_eq!(c.done(), 1);
        assert_eq!(c.aggregate(), TaskStatus::Finished);
    }

    #[test]
    fn status_transitions() {
        assert!(TaskStatus::New.transition(TaskStatus::Pending).is_ok());
        assert!(TaskStatus::Suspended.transition(TaskStatus::Pending).is_ok());
        assert!(TaskStatus::Finished.transition(TaskStatus::Failed).is_err());
        assert!(TaskStatus::Pending.transition(TaskStatus::New).is_err());
        assert_eq!(TaskStatus::New.to_string(), "null");
    }
}
