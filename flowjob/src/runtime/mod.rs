//! Per-task orchestration and the per-process service context.

/// Cooperative cancellation of a submitted task.
pub mod cancel;
/// Shared state of one server process.
pub mod context;
/// The register, admit, dispatch and retry loop.
pub mod orchestrator;
/// Terminal results returned to callers.
pub mod outcome;

pub use cancel::CancelToken;
pub use context::{ServiceContext, ServiceContextBuilder};
pub use orchestrator::TaskOrchestrator;
pub use outcome::{FailureReason, TaskResult, TerminalStatus};
