use std::fmt;

use serde::{Deserialize, Serialize};

use crate::job::{ExportSummary, TaskId};

/// Top-level status every caller receives.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    Failed,
    Rejected,
    Cancelled,
}

impl TerminalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalStatus::Completed => "completed",
            TerminalStatus::Failed => "failed",
            TerminalStatus::Rejected => "rejected",
            TerminalStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable cause attached to a non-completed result.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// An active task already uses the id. Not retryable by the caller.
    DuplicateTaskId,
    /// Every registry slot is taken. Retryable by the caller.
    ServerBusy,
    /// The supplied id cannot be stored in a slot.
    InvalidTaskId,
    /// No admission permit within the allowed attempts.
    SemaphoreTimeout,
    /// The worker pool broke on every attempt.
    ProcessPoolConsistentlyBroken,
    TaskCancelled,
    TaskTimeout,
    /// The worker could not reach the task registry.
    SharedMemoryFailure,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::DuplicateTaskId => "duplicate_task_id",
            FailureReason::ServerBusy => "server_busy",
            FailureReason::InvalidTaskId => "invalid_task_id",
            FailureReason::SemaphoreTimeout => "semaphore_timeout",
            FailureReason::ProcessPoolConsistentlyBroken => "process_pool_consistently_broken",
            FailureReason::TaskCancelled => "task_cancelled",
            FailureReason::TaskTimeout => "task_timeout",
            FailureReason::SharedMemoryFailure => "shared_memory_failure",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured result of one submission. Absent fields are omitted when
/// serialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TerminalStatus,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    /// Human-readable explanation of a rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error detail of a failure or cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ExportSummary>,
}

impl TaskResult {
    fn new(status: TerminalStatus, task_id: impl Into<String>) -> Self {
        Self {
            status,
            task_id: task_id.into(),
            reason: None,
            message: None,
            details: None,
            summary: None,
        }
    }

    pub fn completed(task_id: &TaskId, summary: ExportSummary) -> Self {
        Self {
            summary: Some(summary),
            ..Self::new(TerminalStatus::Completed, task_id.as_str())
        }
    }

    pub fn rejected(
        task_id: impl Into<String>,
        reason: FailureReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            reason: Some(reason),
            message: Some(message.into()),
            ..Self::new(TerminalStatus::Rejected, task_id)
        }
    }

    /// Failure with an optional reason; generic failures carry only details.
    pub fn failed(
        task_id: &TaskId,
        reason: Option<FailureReason>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            reason,
            details: Some(details.into()),
            ..Self::new(TerminalStatus::Failed, task_id.as_str())
        }
    }

    pub fn cancelled(task_id: &TaskId, details: impl Into<String>) -> Self {
        Self {
            reason: Some(FailureReason::TaskCancelled),
            details: Some(details.into()),
            ..Self::new(TerminalStatus::Cancelled, task_id.as_str())
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TerminalStatus::Completed
    }
}
