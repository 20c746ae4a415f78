use std::sync::Arc;
use std::time::Duration;

use crate::completion::{CompletionLog, JsonlCompletionLog, NoopCompletionLog};
use crate::error::{PipelineError, RegistryError};
use crate::job::{status, ExportSummary, FailureKind, JobFailure, JobReply, JobRequest, WorkerContext};
use crate::registry::TaskRegistry;
use crate::telemetry;

/// Fixed, ordered steps of a conversion job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PipelineStep {
    LoadInput,
    ParseRecords,
    DeepInspection,
    Convert,
    WriteOutput,
    Analysis,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 6] = [
        PipelineStep::LoadInput,
        PipelineStep::ParseRecords,
        PipelineStep::DeepInspection,
        PipelineStep::Convert,
        PipelineStep::WriteOutput,
        PipelineStep::Analysis,
    ];

    /// 1-based position in [`ALL`](Self::ALL).
    pub fn index(self) -> usize {
        match self {
            PipelineStep::LoadInput => 1,
            PipelineStep::ParseRecords => 2,
            PipelineStep::DeepInspection => 3,
            PipelineStep::Convert => 4,
            PipelineStep::WriteOutput => 5,
            PipelineStep::Analysis => 6,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PipelineStep::LoadInput => "Loading PCAP",
            PipelineStep::ParseRecords => "Parsing packets",
            PipelineStep::DeepInspection => "Applying DPI",
            PipelineStep::Convert => "Converting IPFIX",
            PipelineStep::WriteOutput => "Writing output",
            PipelineStep::Analysis => "Analysis",
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            PipelineStep::LoadInput => "loading_pcap",
            PipelineStep::ParseRecords => "parsing_packets",
            PipelineStep::DeepInspection => "applying_dpi",
            PipelineStep::Convert => "converting_ipfix",
            PipelineStep::WriteOutput => "writing_output",
            PipelineStep::Analysis => "analysis",
        }
    }

    /// Registry status written once this step has finished.
    pub fn status(self) -> String {
        status::step(self.index(), self.slug())
    }
}

/// The conversion work behind each step.
pub trait ConversionPipeline: Send + Sync {
    fn run_step(&self, step: PipelineStep, request: &JobRequest) -> Result<(), PipelineError>;
}

/// Pipeline that only spends time on each step.
#[derive(Clone, Debug)]
pub struct SimulatedPipeline {
    step_delay: Duration,
}

impl SimulatedPipeline {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }
}

impl Default for SimulatedPipeline {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ConversionPipeline for SimulatedPipeline {
    fn run_step(&self, step: PipelineStep, request: &JobRequest) -> Result<(), PipelineError> {
        let skipped = match step {
            PipelineStep::DeepInspection => !request.params.deep_inspection,
            PipelineStep::Analysis => request.params.analyses.is_empty(),
            _ => false,
        };
        if !skipped {
            std::thread::sleep(self.step_delay);
        }
        Ok(())
    }
}

/// Runs one job inside a worker process and keeps its registry slot current.
#[derive(Debug)]
pub struct ExecutionHandler<P> {
    pipeline: P,
}

impl<P: ConversionPipeline> ExecutionHandler<P> {
    pub fn new(pipeline: P) -> Self {
        Self { pipeline }
    }

    /// Execute `request` to a reply.
    ///
    /// An unreachable registry fails the job immediately with a coordination
    /// failure. Otherwise the slot is freed through
    /// [`TaskRegistry::complete`] whether the pipeline succeeds or not.
    pub fn run(&self, request: &JobRequest) -> JobReply {
        let _span = telemetry::worker_job_span(&request.task_id).entered();
        tracing::info!(
            files = request.files.len(),
            output = %request.output,
            deep_inspection = request.params.deep_inspection,
            "export job started"
        );

        let registry = match open_registry(&request.context) {
            Ok(registry) => registry,
            Err(err) => {
                tracing::error!("task registry unreachable: {err}");
                return JobReply::Failed(JobFailure::new(
                    FailureKind::Coordination,
                    format!("task registry unreachable: {err}"),
                ));
            }
        };

        match self.run_steps(&registry, request) {
            Ok(summary) => {
                registry.update_status(&request.task_id, status::COMPLETED_ALL_STEPS);
                registry.complete(&request.task_id, true);
                tracing::info!("export job completed");
                JobReply::Completed(summary)
            }
            Err(err) => {
                tracing::error!("export job failed: {err}");
                registry.complete(&request.task_id, false);
                JobReply::Failed(err.into())
            }
        }
    }

    fn run_steps(
        &self,
        registry: &TaskRegistry,
        request: &JobRequest,
    ) -> Result<ExportSummary, PipelineError> {
        for step in PipelineStep::ALL {
            tracing::info!(step = step.index(), "{}", step.label());
            self.pipeline.run_step(step, request)?;
            registry.update_status(&request.task_id, &step.status());
        }

        Ok(ExportSummary {
            task_id: request.task_id.clone(),
            output_file: request.output.clone(),
            files_processed: u32::try_from(request.files.len()).unwrap_or(u32::MAX),
            steps_completed: PipelineStep::ALL.len() as u32,
            analyses: request.params.analyses.clone(),
        })
    }
}

fn open_registry(context: &WorkerContext) -> Result<TaskRegistry, RegistryError> {
    let log: Arc<dyn CompletionLog> = match &context.completion_log_dir {
        Some(dir) => match JsonlCompletionLog::open(dir) {
            Ok(log) => Arc::new(log),
            Err(err) => {
                tracing::warn!("completion log unavailable, entries dropped: {err:#}");
                Arc::new(NoopCompletionLog)
            }
        },
        None => Arc::new(NoopCompletionLog),
    };
    TaskRegistry::open(
        &context.registry_path,
        Duration::from_millis(context.lock_timeout_ms),
        log,
    )
}
