use async_trait::async_trait;
use flowjob::{
    status, ConversionPipeline, ExecutionError, ExecutionHandler, ExportSummary, JobExecutor,
    JobReply, JobRequest, TaskId, TaskRegistry,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// What the next call to [`ScriptedExecutor::execute`] does.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Succeed,
    Fail(ExecutionError),
    /// Succeed after sleeping.
    Slow(Duration),
    /// Never finish.
    Hang,
}

impl ScriptStep {
    pub fn broken(reason: &str) -> Self {
        Self::Fail(ExecutionError::BrokenPool(reason.to_string()))
    }

    pub fn process(reason: &str) -> Self {
        Self::Fail(ExecutionError::Process(reason.to_string()))
    }

    pub fn failed(reason: &str) -> Self {
        Self::Fail(ExecutionError::Failed(reason.to_string()))
    }
}

#[derive(Clone, Debug)]
pub struct ExecutionRecord {
    pub task_id: TaskId,
    pub files: usize,
    /// Registry status of the task when the job was dispatched.
    pub status_at_dispatch: Option<String>,
}

/// Executor that plays back a script, one step per call. Once the script
/// runs out every call succeeds.
///
/// With a registry attached it finishes the task's slot the way a real
/// worker does before reporting, except after a broken pool.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    script: Arc<Mutex<VecDeque<ScriptStep>>>,
    calls: Arc<Mutex<Vec<ExecutionRecord>>>,
    registry: Option<Arc<TaskRegistry>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            script: Arc::new(Mutex::new(steps.into_iter().collect())),
            ..Self::default()
        }
    }

    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn push(&self, step: ScriptStep) {
        self.script.lock().push_back(step);
    }

    pub fn record(&self) -> Vec<ExecutionRecord> {
        self.calls.lock().clone()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.calls.lock().len();
        assert_eq!(actual, expected, "Expected {expected} executions, got {actual}");
    }

    fn settle(&self, task_id: &TaskId, success: bool) {
        if let Some(registry) = &self.registry {
            if success {
                registry.update_status(task_id, status::COMPLETED_ALL_STEPS);
            }
            registry.complete(task_id, success);
        }
    }
}

impl std::fmt::Debug for ScriptedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedExecutor")
            .field("remaining", &self.script.lock().len())
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    async fn execute(&self, request: JobRequest) -> Result<ExportSummary, ExecutionError> {
        let status_at_dispatch = self
            .registry
            .as_ref()
            .and_then(|registry| registry.get(&request.task_id))
            .map(|record| record.status);
        self.calls.lock().push(ExecutionRecord {
            task_id: request.task_id.clone(),
            files: request.files.len(),
            status_at_dispatch,
        });

        let step = self.script.lock().pop_front().unwrap_or(ScriptStep::Succeed);
        match step {
            ScriptStep::Succeed => {}
            ScriptStep::Slow(delay) => tokio::time::sleep(delay).await,
            ScriptStep::Hang => std::future::pending::<()>().await,
            ScriptStep::Fail(err) => {
                // A broken pool means the worker died before it could free the slot.
                if !matches!(err, ExecutionError::BrokenPool(_)) {
                    self.settle(&request.task_id, false);
                }
                return Err(err);
            }
        }

        self.settle(&request.task_id, true);
        Ok(ExportSummary {
            task_id: request.task_id,
            output_file: request.output,
            files_processed: request.files.len() as u32,
            steps_completed: 6,
            analyses: request.params.analyses,
        })
    }
}

/// Runs jobs through an [`ExecutionHandler`] on the blocking thread pool of
/// the current process instead of in a worker process.
pub struct InlineExecutor<P> {
    handler: Arc<ExecutionHandler<P>>,
}

impl<P: ConversionPipeline + 'static> InlineExecutor<P> {
    pub fn new(pipeline: P) -> Self {
        Self {
            handler: Arc::new(ExecutionHandler::new(pipeline)),
        }
    }
}

#[async_trait]
impl<P: ConversionPipeline + 'static> JobExecutor for InlineExecutor<P> {
    async fn execute(&self, request: JobRequest) -> Result<ExportSummary, ExecutionError> {
        let handler = self.handler.clone();
        let reply = tokio::task::spawn_blocking(move || handler.run(&request))
            .await
            .map_err(|err| ExecutionError::Process(format!("inline job panicked: {err}")))?;
        match reply {
            JobReply::Completed(summary) => Ok(summary),
            JobReply::Failed(failure) => Err(failure.into()),
        }
    }
}
