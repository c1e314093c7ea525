//! Per-chapter task records tracked by the worker pool.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure captured for one task. Kept as data so snapshots stay `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: String,
    pub message: String,
}

impl From<&PipelineError> for TaskFailure {
    fn from(err: &PipelineError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterTask {
    pub index: usize,
    /// Source text length in characters.
    pub chars: usize,
    pub status: TaskStatus,
    pub error: Option<TaskFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ChapterTask {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            chars: 0,
            status: TaskStatus::Pending,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_chars(mut self, chars: usize) -> Self {
        self.chars = chars;
        self
    }

    pub fn start(&mut self) -> Result<()> {
        self.validate_transition(TaskStatus::Running)?;
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.finish(TaskStatus::Completed, None)
    }

    pub fn fail(&mut self, failure: TaskFailure) -> Result<()> {
        self.finish(TaskStatus::Failed, Some(failure))
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.finish(TaskStatus::Cancelled, None)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    fn finish(&mut self, to: TaskStatus, failure: Option<TaskFailure>) -> Result<()> {
        self.validate_transition(to)?;
        self.status = to;
        self.error = failure;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn validate_transition(&self, to: TaskStatus) -> Result<()> {
        let valid = matches!(
            (self.status, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        );

        if !valid {
            return Err(PipelineError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_lifecycle() {
        let mut task = ChapterTask::new(3).with_chars(1200);
        assert_eq!(task.status, TaskStatus::Pending);

        task.start().unwrap();
        assert!(task.started_at.is_some());
        task.complete().unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.duration_ms().unwrap() >= 0);
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut task = ChapterTask::new(0);
        task.start().unwrap();
        task.fail(TaskFailure {
            code: "E100".into(),
            message: "No audio generated".into(),
        })
        .unwrap();

        assert!(task.complete().is_err());
        assert!(task.cancel().is_err());
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_ref().unwrap().code, "E100");
    }

    #[test]
    fn test_pending_can_be_cancelled_but_not_completed() {
        let mut task = ChapterTask::new(1);
        assert!(task.complete().is_err());
        task.cancel().unwrap();
        assert!(task.status.is_terminal());
    }
}
