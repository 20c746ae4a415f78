//! Code that runs inside a pool worker process.
//!
//! The parent writes one [`JobRequest`](crate::job::JobRequest) per line to
//! the worker's stdin; [`serve`] runs each through an [`ExecutionHandler`]
//! and answers with one [`JobReply`](crate::job::JobReply) line on stdout.

mod handler;
mod serve;

pub use handler::{ConversionPipeline, ExecutionHandler, PipelineStep, SimulatedPipeline};
pub use serve::serve;
