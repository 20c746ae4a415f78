//! Flowjob - bulk capture-to-flow export orchestration.
//!
//! Accepts batches of packet-capture files, converts each batch through a
//! multi-step pipeline inside a pool of worker processes, and keeps a
//! host-wide view of every in-flight task in a shared region so concurrent
//! server processes agree on identity and capacity.
//!
//! # Core Concepts
//!
//! - **Registry**: The [`TaskRegistry`] is a fixed set of slots in a region
//!   file shared by every process on the host. It enforces task-id
//!   uniqueness and the host-wide cap on registered tasks.
//!
//! - **Admission**: The [`Admission`] trait and its [`SemaphoreAdmission`]
//!   implementation bound how many jobs one server process has in flight
//!   against its pool.
//!
//! - **Pool**: The [`WorkerPoolManager`] owns long-lived worker processes,
//!   replaces a pool that broke mid-job, and kills only the workers it
//!   started.
//!
//! - **Worker**: [`worker::serve`] runs inside each worker process and drives
//!   an [`ExecutionHandler`] through the conversion pipeline, reporting step
//!   progress to the registry.
//!
//! - **Runtime**: The [`TaskOrchestrator`] runs one submission through
//!   registration, admission, dispatch and retry to a [`TaskResult`]; the
//!   [`ServiceContext`] wires the pieces together for one server process.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use flowjob::*;
//!
//! let context = ServiceContextBuilder::new(ServiceConfig::default()).build()?;
//! let result = context
//!     .submit(ExportSubmission::new(vec!["/captures/a.pcap".into()], "/out/a.ipfix"))
//!     .await;
//! println!("{}", serde_json::to_string(&result)?);
//! context.shutdown()?;
//! ```

/// Per-process admission gate.
///
/// The `admission` module provides the [`Admission`] trait, the
/// [`SemaphoreAdmission`] implementation and the RAII [`AdmissionPermit`]
/// returned by [`admit`].
pub mod admission;

/// Append-only success and failure logs written when a task leaves the
/// registry.
pub mod completion;

/// Configuration for the registry, pool, admission gate and orchestrator.
pub mod config;

/// Error types shared across the crate.
pub mod error;

/// Task identity, submissions and the worker wire format.
///
/// The `job` module defines:
/// - [`TaskId`] - validated or generated task identifier
/// - [`ExportSubmission`] and [`JobParams`] - what callers submit
/// - [`JobRequest`] and [`JobReply`] - one line each way between the
///   server and a worker process
/// - [`status`] - status tokens written into registry slots
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus metrics, enabled with the `metrics` feature.
pub mod metrics;

/// Worker process pool and its manager.
pub mod pool;

/// Host-wide shared task registry.
pub mod registry;

/// Task orchestration and the per-process service context.
///
/// The `runtime` module provides:
/// - [`TaskOrchestrator`] - the per-task control loop
/// - [`ServiceContext`] and [`ServiceContextBuilder`] - process wiring
/// - [`CancelToken`] - cancellation of a running submission
/// - [`TaskResult`], [`TerminalStatus`] and [`FailureReason`] - results
pub mod runtime;

/// Tracing spans and metric hooks.
pub mod telemetry;

/// Code that runs inside worker processes.
pub mod worker;

pub use admission::{admit, Admission, AdmissionPermit, SemaphoreAdmission};
pub use completion::{
    CompletionEntry, CompletionLog, CompletionStream, JsonlCompletionLog, NoopCompletionLog,
};
pub use config::*;
pub use error::*;
pub use job::*;
pub use pool::{JobExecutor, WorkerPool, WorkerPoolManager};
pub use registry::{ClaimError, Slot, SlotCounts, TaskRecord, TaskRegistry};
pub use runtime::{
    CancelToken, FailureReason, ServiceContext, ServiceContextBuilder, TaskOrchestrator,
    TaskResult, TerminalStatus,
};
pub use worker::{ConversionPipeline, ExecutionHandler, PipelineStep, SimulatedPipeline};
