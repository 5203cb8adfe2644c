//! Shared deterministic types for the run engine.
//!
//! These types define stable contracts between the queue, the plan state
//! machine and the read projections. They carry no I/O and serialize to the
//! lowercase names used in persisted artifacts.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a submitted task.
///
/// Transitions only move forward: `queued → running → {done, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_become(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Done)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Done,
    Failed,
}

impl RunOutcome {
    /// Task status recorded in the queue for this outcome.
    pub fn task_status(self) -> TaskStatus {
        match self {
            RunOutcome::Done => TaskStatus::Done,
            RunOutcome::Failed => TaskStatus::Failed,
        }
    }
}

/// How much optional detail the trace captures.
///
/// Verbosity only filters optional fields. It never changes which events are
/// written or how they are numbered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Minimal,
    #[default]
    Standard,
    Full,
}

/// Optional trace fields gated by [`Verbosity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detail {
    /// Screenshot paths captured while visiting pages.
    Screenshots,
    /// Full text of visited pages.
    PageText,
}

impl Verbosity {
    pub fn captures(self, detail: Detail) -> bool {
        match (self, detail) {
            (Verbosity::Minimal, _) => false,
            (Verbosity::Standard, Detail::Screenshots) => true,
            (Verbosity::Standard, Detail::PageText) => false,
            (Verbosity::Full, _) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_only_moves_forward() {
        assert!(TaskStatus::Queued.can_become(TaskStatus::Running));
        assert!(TaskStatus::Running.can_become(TaskStatus::Done));
        assert!(TaskStatus::Running.can_become(TaskStatus::Failed));
        assert!(!TaskStatus::Queued.can_become(TaskStatus::Done));
        assert!(!TaskStatus::Done.can_become(TaskStatus::Running));
        assert!(!TaskStatus::Failed.can_become(TaskStatus::Queued));
    }

    #[test]
    fn verbosity_gates_details() {
        assert!(!Verbosity::Minimal.captures(Detail::Screenshots));
        assert!(Verbosity::Standard.captures(Detail::Screenshots));
        assert!(!Verbosity::Standard.captures(Detail::PageText));
        assert!(Verbosity::Full.captures(Detail::PageText));
    }

    #[test]
    fn statuses_serialize_lowercase() {
        let json = serde_json::to_string(&StepStatus::Completed).expect("serialize");
        assert_eq!(json, "\"completed\"");
        let json = serde_json::to_string(&TaskStatus::Queued).expect("serialize");
        assert_eq!(json, "\"queued\"");
    }
}
