//! Test doubles and fixtures for exercising flowjob without real worker
//! processes.

mod admission;
mod completion;
mod executor;
mod fixture;

pub use admission::{AdmissionEvent, RecordingAdmission};
pub use completion::MemoryCompletionLog;
pub use executor::{ExecutionRecord, InlineExecutor, ScriptStep, ScriptedExecutor};
pub use fixture::{submission, TempRegistry};
