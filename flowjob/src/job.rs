use std::fmt::Display;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest task identifier, in bytes, that fits a registry slot.
pub const MAX_TASK_ID_LEN: usize = 64;

/// Prefix reserved for free registry slots.
pub const SENTINEL_PREFIX: char = '#';

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate `task_<unix seconds>_<8 hex chars>`.
    pub fn generate() -> Self {
        let random = Uuid::new_v4().simple().to_string();
        Self(format!("task_{}_{}", Utc::now().timestamp(), &random[..8]))
    }

    /// Accept a caller-supplied identifier if it can live in a slot.
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidTaskId> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidTaskId::Empty);
        }
        if raw.starts_with(SENTINEL_PREFIX) {
            return Err(InvalidTaskId::ReservedPrefix(raw));
        }
        if raw.len() > MAX_TASK_ID_LEN {
            return Err(InvalidTaskId::TooLong(raw.len()));
        }
        if raw.chars().any(char::is_control) {
            return Err(InvalidTaskId::ControlCharacter);
        }
        Ok(Self(raw))
    }

    /// Caller-supplied identifier when present, a generated one otherwise.
    pub fn from_param(param: Option<&str>) -> Result<Self, InvalidTaskId> {
        match param {
            Some(raw) => Self::parse(raw),
            None => Ok(Self::generate()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum InvalidTaskId {
    #[error("task id is empty")]
    Empty,
    #[error("task id `{0}` uses the reserved `#` prefix")]
    ReservedPrefix(String),
    #[error("task id is {0} bytes, at most 64 allowed")]
    TooLong(usize),
    #[error("task id contains control characters")]
    ControlCharacter,
}

/// Free-form job parameters supplied with a submission.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Run deep packet inspection before conversion.
    #[serde(default, alias = "DPI")]
    pub deep_inspection: bool,
    /// Named analyses to run over the converted output.
    #[serde(default)]
    pub analyses: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl JobParams {
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_deep_inspection(mut self, enabled: bool) -> Self {
        self.deep_inspection = enabled;
        self
    }

    pub fn with_analysis(mut self, name: impl Into<String>) -> Self {
        self.analyses.push(name.into());
        self
    }
}

/// A bulk export request as received from the submission boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportSubmission {
    /// Ordered capture files to convert.
    pub files: Vec<PathBuf>,
    /// Destination of the flow-record output.
    pub output: String,
    #[serde(default)]
    pub params: JobParams,
}

impl ExportSubmission {
    pub fn new(files: Vec<PathBuf>, output: impl Into<String>) -> Self {
        Self {
            files,
            output: output.into(),
            params: JobParams::default(),
        }
    }

    pub fn with_params(mut self, params: JobParams) -> Self {
        self.params = params;
        self
    }
}

/// Where a worker process finds the shared coordination state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerContext {
    pub registry_path: PathBuf,
    pub lock_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_log_dir: Option<PathBuf>,
}

/// One unit of work handed to a pool worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub task_id: TaskId,
    pub files: Vec<PathBuf>,
    pub output: String,
    pub params: JobParams,
    pub context: WorkerContext,
}

/// What a worker reports after converting a batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub task_id: TaskId,
    pub output_file: String,
    pub files_processed: u32,
    pub steps_completed: u32,
    #[serde(default)]
    pub analyses: Vec<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Registry unreachable from the worker.
    Coordination,
    Timeout,
    /// OS-level fault inside the worker.
    Process,
    /// Conversion pipeline rejected the input.
    Pipeline,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Reply line written by a worker for each [`JobRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobReply {
    Completed(ExportSummary),
    Failed(JobFailure),
}

/// Status tokens written into registry slots.
pub mod status {
    pub const STARTING: &str = "starting";
    pub const REGISTERED: &str = "registered";
    pub const RUNNING: &str = "running";
    pub const COMPLETED_ALL_STEPS: &str = "completed_all_steps";
    pub const EMPTY: &str = "empty";

    /// Waiting for admission before the given attempt.
    pub fn semaphore_retry(attempt: u32) -> String {
        format!("semaphore_retry_attempt_{attempt}")
    }

    /// Re-dispatching after a pool or process fault.
    pub fn retrying(attempt: u32) -> String {
        format!("retrying_attempt_{attempt}")
    }

    pub fn step(index: usize, slug: &str) -> String {
        format!("step_{index}_{slug}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_follow_task_time_random_shape() {
        let id = TaskId::generate();
        let parts: Vec<&str> = id.as_str().split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "task");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 8);
        assert_ne!(TaskId::generate(), TaskId::generate());
    }

    #[test]
    fn caller_ids_are_validated() {
        assert_eq!(TaskId::parse("export-7").unwrap().as_str(), "export-7");
        assert_eq!(TaskId::parse(""), Err(InvalidTaskId::Empty));
        assert!(matches!(
            TaskId::parse("#empty_slot_0"),
            Err(InvalidTaskId::ReservedPrefix(_))
        ));
        assert_eq!(TaskId::parse("x".repeat(65)), Err(InvalidTaskId::TooLong(65)));
        assert_eq!(TaskId::parse("a\nb"), Err(InvalidTaskId::ControlCharacter));
    }

    #[test]
    fn params_accept_legacy_dpi_key() {
        let params: JobParams =
            serde_json::from_str(r#"{"task_id":"t1","DPI":true,"analyses":["top_talkers"],"site":"lab"}"#)
                .unwrap();
        assert!(params.deep_inspection);
        assert_eq!(params.task_id.as_deref(), Some("t1"));
        assert_eq!(params.analyses, vec!["top_talkers".to_string()]);
        assert_eq!(params.extra.get("site").and_then(|v| v.as_str()), Some("lab"));
    }

    #[test]
    fn reply_is_tagged_by_outcome() {
        let reply = JobReply::Failed(JobFailure::new(FailureKind::Coordination, "no region"));
        let line = serde_json::to_string(&reply).unwrap();
        assert!(line.contains(r#""outcome":"failed""#));
        assert!(line.contains(r#""kind":"coordination""#));
        let back: JobReply = serde_json::from_str(&line).unwrap();
        assert_eq!(back, reply);
    }

    #[test]
    fn status_tokens() {
        assert_eq!(status::retrying(2), "retrying_attempt_2");
        assert_eq!(status::semaphore_retry(3), "semaphore_retry_attempt_3");
        assert_eq!(status::step(4, "converting_ipfix"), "step_4_converting_ipfix");
    }
}
