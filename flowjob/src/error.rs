//! Error types for the registry, the worker pool and job execution.
//!
//! Failures are classified where they happen. The orchestrator decides
//! whether to retry by matching on [`ExecutionError`] variants, never by
//! inspecting message text.

use std::path::PathBuf;

use thiserror::Error;

use crate::job::{FailureKind, JobFailure};

/// Errors raised by the shared task registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The region lock could not be taken before the deadline.
    #[error("registry lock not acquired within {timeout_ms}ms")]
    LockTimeout {
        /// The configured lock timeout.
        timeout_ms: u64,
    },

    /// The region file exists but is not a registry region.
    #[error("invalid registry region at {path}: {reason}")]
    InvalidRegion {
        /// Region path.
        path: PathBuf,
        /// What failed validation.
        reason: String,
    },

    /// A record field does not fit the fixed slot layout.
    #[error("field `{field}` is {len} bytes, slot allows {max}")]
    FieldTooLong {
        /// Field name.
        field: &'static str,
        /// Encoded length.
        len: usize,
        /// Maximum encoded length.
        max: usize,
    },

    /// The capacity requested at creation is unusable.
    #[error("registry capacity must be between 1 and {max}, got {requested}")]
    InvalidCapacity {
        /// Requested `max_items`.
        requested: usize,
        /// Largest supported capacity.
        max: usize,
    },

    /// Region I/O failed.
    #[error("registry io error: {0}")]
    Io(#[from] std::io::Error),

    /// The advisory lock syscall failed for a reason other than contention.
    #[error("registry lock error: {0}")]
    Lock(#[from] nix::errno::Errno),
}

/// Errors raised by the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool lost a worker mid-job and must be recreated.
    #[error("worker pool broken: {0}")]
    Broken(String),

    /// A worker process could not be started.
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    /// A worker answered with something that is not a job reply.
    #[error("worker protocol error: {0}")]
    Protocol(String),

    /// The pool was shut down while the job was waiting for a worker.
    #[error("worker pool is shut down")]
    Shutdown,
}

/// Typed classification of a failed job attempt.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// The pool was broken; retry once it has been recreated.
    #[error("process pool broken: {0}")]
    BrokenPool(String),

    /// The job exceeded its deadline.
    #[error("job timed out: {0}")]
    Timeout(String),

    /// The execution handler could not reach the task registry.
    #[error("task registry unreachable from worker: {0}")]
    Coordination(String),

    /// A process-level fault outside the pool's broken state.
    #[error("worker process fault: {0}")]
    Process(String),

    /// Any other failure reported by the pipeline.
    #[error("{0}")]
    Failed(String),
}

impl ExecutionError {
    /// Whether the orchestrator may retry this failure while attempts remain.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BrokenPool(_) | Self::Process(_))
    }
}

impl From<JobFailure> for ExecutionError {
    fn from(failure: JobFailure) -> Self {
        match failure.kind {
            FailureKind::Coordination => Self::Coordination(failure.message),
            FailureKind::Timeout => Self::Timeout(failure.message),
            FailureKind::Process => Self::Process(failure.message),
            FailureKind::Pipeline => Self::Failed(failure.message),
        }
    }
}

impl From<PoolError> for ExecutionError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Broken(reason) => Self::BrokenPool(reason),
            PoolError::Spawn(err) => Self::Process(format!("spawn: {err}")),
            PoolError::Protocol(reason) => Self::Process(reason),
            PoolError::Shutdown => Self::Failed("worker pool is shut down".into()),
        }
    }
}

/// Failure of a single pipeline step inside a worker.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The step ran past its own deadline.
    #[error("step timed out: {0}")]
    Timeout(String),

    /// The step lost a helper process or similar OS resource.
    #[error("process fault: {0}")]
    Process(String),

    /// Input or conversion failure.
    #[error("{0}")]
    Failed(String),

    /// Filesystem error while reading input or writing output.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PipelineError> for JobFailure {
    fn from(err: PipelineError) -> Self {
        let kind = match &err {
            PipelineError::Timeout(_) => FailureKind::Timeout,
            PipelineError::Process(_) => FailureKind::Process,
            PipelineError::Failed(_) | PipelineError::Io(_) => FailureKind::Pipeline,
        };
        JobFailure::new(kind, err.to_string())
    }
}
