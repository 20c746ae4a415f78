use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::Instrument;

use crate::admission::{admit, Admission};
use crate::config::OrchestratorConfig;
use crate::error::ExecutionError;
use crate::job::{status, ExportSubmission, JobRequest, TaskId};
use crate::pool::JobExecutor;
use crate::registry::{ClaimError, TaskRecord, TaskRegistry};
use crate::telemetry::{self, TaskTimer};

use super::cancel::CancelToken;
use super::outcome::{FailureReason, TaskResult};

/// Where one attempt left the task.
enum Step {
    Retry,
    Done(TaskResult),
}

/// Per-task control loop: register, admit, dispatch, retry, finalize.
///
/// Every submission ends in a [`TaskResult`]; no failure escapes to the
/// caller as an error.
pub struct TaskOrchestrator<E: ?Sized = dyn JobExecutor, A: ?Sized = dyn Admission> {
    config: OrchestratorConfig,
    registry: Arc<TaskRegistry>,
    executor: Arc<E>,
    admission: Arc<A>,
    output_display_len: usize,
    completion_log_dir: Option<PathBuf>,
}

impl<E: ?Sized, A: ?Sized> fmt::Debug for TaskOrchestrator<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry.path())
            .field("executor_type", &std::any::type_name::<E>())
            .field("admission_type", &std::any::type_name::<A>())
            .finish()
    }
}

impl<E, A> TaskOrchestrator<E, A>
where
    E: JobExecutor + ?Sized,
    A: Admission + ?Sized,
{
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<TaskRegistry>,
        executor: Arc<E>,
        admission: Arc<A>,
    ) -> Self {
        Self {
            config,
            registry,
            executor,
            admission,
            output_display_len: 50,
            completion_log_dir: None,
        }
    }

    /// Characters of the output path kept in the registry record.
    pub fn with_output_display_len(mut self, len: usize) -> Self {
        self.output_display_len = len;
        self
    }

    /// Directory workers append completion entries to.
    pub fn with_completion_log_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.completion_log_dir = dir;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub async fn submit(&self, submission: ExportSubmission) -> TaskResult {
        self.submit_with_cancel(submission, CancelToken::new()).await
    }

    /// Run a submission to its terminal status. Cancelling `cancel` ends it
    /// as `cancelled` whether it is waiting for admission or for the job.
    pub async fn submit_with_cancel(
        &self,
        submission: ExportSubmission,
        cancel: CancelToken,
    ) -> TaskResult {
        let supplied = submission.params.task_id.clone();
        let task_id = match TaskId::from_param(supplied.as_deref()) {
            Ok(task_id) => task_id,
            Err(err) => {
                tracing::warn!("rejecting submission: {err}");
                return TaskResult::rejected(
                    supplied.unwrap_or_default(),
                    FailureReason::InvalidTaskId,
                    err.to_string(),
                );
            }
        };

        let timer = TaskTimer::start(&task_id);
        let span = telemetry::task_span(&task_id);
        let result = self.run(task_id, submission, &cancel).instrument(span).await;
        timer.finish(result.status.as_str(), result.reason.map(FailureReason::as_str));
        result
    }

    async fn run(
        &self,
        task_id: TaskId,
        submission: ExportSubmission,
        cancel: &CancelToken,
    ) -> TaskResult {
        tracing::info!(
            files = submission.files.len(),
            output = %submission.output,
            "task submitted"
        );

        let record = TaskRecord::new(
            task_id.clone(),
            submission.files.len(),
            &submission.output,
            self.output_display_len,
        );
        let claimed = self
            .on_registry({
                let record = record.clone();
                move |registry| registry.claim(&record)
            })
            .await;
        match claimed {
            Ok(slot) => tracing::debug!(slot, "task slot claimed"),
            Err(ClaimError::Duplicate(_)) => {
                return TaskResult::rejected(
                    task_id.as_str(),
                    FailureReason::DuplicateTaskId,
                    format!("Task {task_id} already exists"),
                );
            }
            Err(ClaimError::Full) => {
                return TaskResult::rejected(
                    task_id.as_str(),
                    FailureReason::ServerBusy,
                    "Server busy - all slots full",
                );
            }
            Err(ClaimError::Unavailable(err)) => {
                tracing::warn!("task registry unavailable: {err}");
                return TaskResult::rejected(
                    task_id.as_str(),
                    FailureReason::ServerBusy,
                    format!("Server busy - task registry unavailable: {err}"),
                );
            }
        }
        self.set_status(&task_id, status::REGISTERED).await;

        let request = JobRequest {
            task_id,
            files: submission.files,
            output: submission.output,
            params: submission.params,
            context: self.registry.worker_context(self.completion_log_dir.clone()),
        };

        let attempts = self.config.max_retries + 1;
        let mut attempt = 1;
        loop {
            let span = telemetry::attempt_span(&request.task_id, attempt);
            let step = self
                .attempt(&request, &record, attempt, attempts, cancel)
                .instrument(span)
                .await;
            match step {
                Step::Done(result) => return result,
                Step::Retry => attempt += 1,
            }
        }
    }

    /// One admission + dispatch round. Any finalization happens while the
    /// permit is still held; the permit is released when this returns.
    async fn attempt(
        &self,
        request: &JobRequest,
        record: &TaskRecord,
        attempt: u32,
        attempts: u32,
        cancel: &CancelToken,
    ) -> Step {
        let task_id = &request.task_id;
        let can_retry = attempt < attempts;
        tracing::info!(attempts, "waiting for admission");

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Step::Done(self.finish_cancelled(task_id, "cancelled while waiting for admission").await);
            }
            permit = admit(self.admission.as_ref(), self.config.admission_timeout()) => permit,
        };

        let Some(_permit) = permit else {
            telemetry::record_attempt_failed(task_id, attempt, "admission_timeout", can_retry);
            if !can_retry {
                self.finalize(task_id, false).await;
                return Step::Done(TaskResult::failed(
                    task_id,
                    Some(FailureReason::SemaphoreTimeout),
                    "Could not acquire process pool access",
                ));
            }
            self.mark(record, &status::semaphore_retry(attempt + 1)).await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Step::Done(self.finish_cancelled(task_id, "cancelled during retry delay").await);
                }
                _ = tokio::time::sleep(self.config.retry_delay()) => {}
            }
            return Step::Retry;
        };

        self.set_status(task_id, status::RUNNING).await;
        let job = self.executor.execute(request.clone());
        let deadline = async {
            match self.config.job_timeout() {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Step::Done(self.finish_cancelled(task_id, "cancelled while the job was running").await);
            }
            _ = deadline => Err(ExecutionError::Timeout(format!(
                "job exceeded {}ms",
                self.config.job_timeout_ms.unwrap_or_default()
            ))),
            result = job => result,
        };

        match outcome {
            Ok(summary) => {
                self.finalize(task_id, true).await;
                Step::Done(TaskResult::completed(task_id, summary))
            }
            Err(err) if err.is_retryable() && can_retry => {
                telemetry::record_attempt_failed(task_id, attempt, failure_kind(&err), true);
                tracing::warn!("retrying after: {err}");
                self.mark(record, &status::retrying(attempt + 1)).await;
                Step::Retry
            }
            Err(err) => {
                telemetry::record_attempt_failed(task_id, attempt, failure_kind(&err), false);
                self.finalize(task_id, false).await;
                Step::Done(failure_result(task_id, err))
            }
        }
    }

    async fn finish_cancelled(&self, task_id: &TaskId, details: &str) -> TaskResult {
        tracing::warn!("{details}");
        self.finalize(task_id, false).await;
        TaskResult::cancelled(task_id, details)
    }

    /// Run a registry operation on the blocking pool. The region lock may
    /// poll for up to its timeout, which must not stall a runtime thread.
    async fn on_registry<T, F>(&self, op: F) -> T
    where
        F: FnOnce(&TaskRegistry) -> T + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.registry.clone();
        match tokio::task::spawn_blocking(move || op(&registry)).await {
            Ok(value) => value,
            Err(err) => std::panic::resume_unwind(err.into_panic()),
        }
    }

    async fn set_status(&self, task_id: &TaskId, status: &'static str) -> bool {
        let task_id = task_id.clone();
        self.on_registry(move |registry| registry.update_status(&task_id, status))
            .await
    }

    /// Free the task's slot. On success the worker normally freed it
    /// already, in which case this is a no-op.
    async fn finalize(&self, task_id: &TaskId, success: bool) {
        let id = task_id.clone();
        let freed = self
            .on_registry(move |registry| registry.complete(&id, success))
            .await;
        if !freed {
            tracing::debug!(success, "task slot already free at finalization");
        }
    }

    /// Write an in-between status, re-claiming the slot if the worker
    /// already freed it on a failed attempt.
    async fn mark(&self, record: &TaskRecord, status: &str) {
        let mut record = record.clone();
        record.touch(status);
        let outcome = self
            .on_registry(move |registry| {
                if registry.update_status(&record.task_id, &record.status) {
                    return Ok(());
                }
                registry.claim(&record).map(|_| ())
            })
            .await;
        if let Err(err) = outcome {
            tracing::warn!(status, "could not re-register task between attempts: {err}");
        }
    }
}

fn failure_kind(err: &ExecutionError) -> &'static str {
    match err {
        ExecutionError::BrokenPool(_) => "broken_pool",
        ExecutionError::Timeout(_) => "timeout",
        ExecutionError::Coordination(_) => "coordination",
        ExecutionError::Process(_) => "process",
        ExecutionError::Failed(_) => "failed",
    }
}

fn failure_result(task_id: &TaskId, err: ExecutionError) -> TaskResult {
    match err {
        ExecutionError::BrokenPool(details) => TaskResult::failed(
            task_id,
            Some(FailureReason::ProcessPoolConsistentlyBroken),
            details,
        ),
        ExecutionError::Timeout(details) => {
            TaskResult::failed(task_id, Some(FailureReason::TaskTimeout), details)
        }
        ExecutionError::Coordination(details) => {
            TaskResult::failed(task_id, Some(FailureReason::SharedMemoryFailure), details)
        }
        ExecutionError::Process(details) | ExecutionError::Failed(details) => {
            TaskResult::failed(task_id, None, details)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::SemaphoreAdmission;
    use crate::completion::NoopCompletionLog;
    use crate::config::RegistryConfig;
    use crate::job::{ExportSummary, JobParams};
    use crate::runtime::TerminalStatus;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Pops one scripted outcome per call.
    struct Script(Mutex<VecDeque<Result<(), ExecutionError>>>);

    #[async_trait]
    impl JobExecutor for Script {
        async fn execute(&self, request: JobRequest) -> Result<ExportSummary, ExecutionError> {
            let next = self.0.lock().pop_front().unwrap_or(Ok(()));
            next.map(|()| ExportSummary {
                task_id: request.task_id,
                output_file: request.output,
                files_processed: request.files.len() as u32,
                steps_completed: 6,
                analyses: Vec::new(),
            })
        }
    }

    fn orchestrator(
        script: Vec<Result<(), ExecutionError>>,
    ) -> (tempfile::TempDir, TaskOrchestrator<Script, SemaphoreAdmission>) {
        let dir = tempfile::tempdir().unwrap();
        let config = RegistryConfig::new(dir.path().join("registry")).with_max_items(2);
        let registry = Arc::new(TaskRegistry::create(&config, Arc::new(NoopCompletionLog)).unwrap());
        let orchestrator = TaskOrchestrator::new(
            OrchestratorConfig::default()
                .with_admission_timeout(20)
                .with_retry_delay(0),
            registry,
            Arc::new(Script(Mutex::new(script.into()))),
            Arc::new(SemaphoreAdmission::new(1)),
        );
        (dir, orchestrator)
    }

    fn submission(id: &str) -> ExportSubmission {
        ExportSubmission::new(vec!["/captures/a.pcap".into()], "/out/a.ipfix")
            .with_params(JobParams::default().with_task_id(id))
    }

    #[tokio::test]
    async fn test_success_frees_slot_and_permit() {
        let (_dir, orch) = orchestrator(vec![]);
        let result = orch.submit(submission("ok")).await;
        assert_eq!(result.status, TerminalStatus::Completed);
        assert!(orch.registry().list_active().is_empty());
        assert_eq!(orch.admission.available(), 1);
    }

    #[tokio::test]
    async fn test_invalid_id_is_rejected_before_registration() {
        let (_dir, orch) = orchestrator(vec![]);
        let result = orch.submit(submission("#empty_slot_0")).await;
        assert_eq!(result.status, TerminalStatus::Rejected);
        assert_eq!(result.reason, Some(FailureReason::InvalidTaskId));
        assert_eq!(result.task_id, "#empty_slot_0");
    }

    #[tokio::test]
    async fn test_process_fault_retries_then_fails_with_details() {
        let fault = || Err(ExecutionError::Process("worker lost".into()));
        let (_dir, orch) = orchestrator(vec![fault(), fault(), fault()]);
        let result = orch.submit(submission("flaky")).await;
        assert_eq!(result.status, TerminalStatus::Failed);
        assert_eq!(result.reason, None);
        assert_eq!(result.details.as_deref(), Some("worker lost"));
        assert!(orch.registry().list_active().is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_failure_is_not_retried() {
        let (_dir, orch) = orchestrator(vec![Err(ExecutionError::Failed("bad capture".into()))]);
        let result = orch.submit(submission("bad")).await;
        assert_eq!(result.details.as_deref(), Some("bad capture"));
        assert!(orch.executor.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_admission_timeout_exhausts_attempts() {
        let (_dir, orch) = orchestrator(vec![]);
        assert!(orch.admission.acquire(Duration::from_millis(10)).await);

        let result = orch.submit(submission("starved")).await;
        assert_eq!(result.status, TerminalStatus::Failed);
        assert_eq!(result.reason, Some(FailureReason::SemaphoreTimeout));
        assert!(orch.registry().list_active().is_empty());
        orch.admission.release();
    }

    #[tokio::test]
    async fn test_job_timeout_is_terminal() {
        struct Stuck;

        #[async_trait]
        impl JobExecutor for Stuck {
            async fn execute(&self, _request: JobRequest) -> Result<ExportSummary, ExecutionError> {
                std::future::pending().await
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let config = RegistryConfig::new(dir.path().join("registry"));
        let registry = Arc::new(TaskRegistry::create(&config, Arc::new(NoopCompletionLog)).unwrap());
        let orch = TaskOrchestrator::new(
            OrchestratorConfig::default().with_job_timeout(30),
            registry,
            Arc::new(Stuck),
            Arc::new(SemaphoreAdmission::new(1)),
        );

        let result = orch.submit(submission("slow")).await;
        assert_eq!(result.reason, Some(FailureReason::TaskTimeout));
        assert_eq!(orch.admission.available(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_admission() {
        let (_dir, orch) = orchestrator(vec![]);
        let orch = Arc::new(orch);
        assert!(orch.admission.acquire(Duration::from_millis(10)).await);

        let cancel = CancelToken::new();
        let task = tokio::spawn({
            let orch = orch.clone();
            let cancel = cancel.clone();
            async move { orch.submit_with_cancel(submission("waiting"), cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();

        let result = task.await.unwrap();
        assert_eq!(result.status, TerminalStatus::Cancelled);
        assert_eq!(result.reason, Some(FailureReason::TaskCancelled));
        assert!(orch.registry().list_active().is_empty());
        orch.admission.release();
        assert_eq!(orch.admission.available(), 1);
    }

    #[tokio::test]
    async fn test_contended_registry_lock_leaves_the_runtime_free() {
        use nix::fcntl::{Flock, FlockArg};

        let dir = tempfile::tempdir().unwrap();
        let config = RegistryConfig::new(dir.path().join("registry")).with_lock_timeout(2_000);
        let registry = Arc::new(TaskRegistry::create(&config, Arc::new(NoopCompletionLog)).unwrap());
        let orch = TaskOrchestrator::new(
            OrchestratorConfig::default(),
            registry,
            Arc::new(Script(Mutex::new(VecDeque::new()))),
            Arc::new(SemaphoreAdmission::new(1)),
        );

        // Another process holding the region lock.
        let file = std::fs::File::open(&config.path).unwrap();
        let held = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, e)| e).unwrap();
        let unlock = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(held);
        });

        // On this single-threaded runtime the unlock task can only run if the
        // claim waits off the runtime thread.
        let started = std::time::Instant::now();
        let result = orch.submit(submission("contended")).await;
        assert_eq!(result.status, TerminalStatus::Completed, "{result:?}");
        assert!(started.elapsed() < Duration::from_millis(1_500));
        unlock.await.unwrap();
    }
}
