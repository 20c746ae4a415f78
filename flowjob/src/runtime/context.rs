use std::fmt;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::Context;

use crate::admission::{Admission, SemaphoreAdmission};
use crate::completion::{CompletionLog, JsonlCompletionLog, NoopCompletionLog};
use crate::config::ServiceConfig;
use crate::job::ExportSubmission;
use crate::pool::{JobExecutor, WorkerPoolManager};
use crate::registry::TaskRegistry;

use super::cancel::CancelToken;
use super::orchestrator::TaskOrchestrator;
use super::outcome::TaskResult;

/// Everything one server process shares between its submissions: the
/// registry handle, the admission gate, the pool manager and the
/// orchestrator built on top of them.
///
/// Build one per process with [`ServiceContextBuilder`] and call
/// [`shutdown`](Self::shutdown) on the way out.
pub struct ServiceContext {
    config: ServiceConfig,
    registry: Arc<TaskRegistry>,
    admission: Arc<dyn Admission>,
    pools: Option<Arc<WorkerPoolManager>>,
    orchestrator: TaskOrchestrator,
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("registry", &self.registry)
            .field("admission_capacity", &self.admission.capacity())
            .field("pools", &self.pools)
            .finish()
    }
}

impl ServiceContext {
    pub fn builder(config: ServiceConfig) -> ServiceContextBuilder {
        ServiceContextBuilder::new(config)
    }

    pub async fn submit(&self, submission: ExportSubmission) -> TaskResult {
        self.orchestrator.submit(submission).await
    }

    pub async fn submit_with_cancel(
        &self,
        submission: ExportSubmission,
        cancel: CancelToken,
    ) -> TaskResult {
        self.orchestrator.submit_with_cancel(submission, cancel).await
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn admission(&self) -> &Arc<dyn Admission> {
        &self.admission
    }

    /// The pool manager, unless the context was built around a custom executor.
    pub fn pools(&self) -> Option<&Arc<WorkerPoolManager>> {
        self.pools.as_ref()
    }

    /// Kill every worker this process started and release the registry
    /// region if this process created it.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        release(self.pools.as_deref(), &self.registry)
    }

    /// [`shutdown`](Self::shutdown) bounded by `timeout`. If cleanup fails
    /// or does not finish in time the process exits with status 1.
    pub fn shutdown_or_exit(&self, timeout: Duration) {
        let pools = self.pools.clone();
        let registry = self.registry.clone();
        let (tx, rx) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name("flowjob-shutdown".into())
            .spawn(move || {
                let _ = tx.send(release(pools.as_deref(), &registry));
            });
        if let Err(err) = spawned {
            tracing::error!("could not start shutdown thread: {err}");
            std::process::exit(1);
        }

        match rx.recv_timeout(timeout) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!("shutdown failed: {err:#}");
                std::process::exit(1);
            }
            Err(_) => {
                tracing::error!(timeout_ms = timeout.as_millis() as u64, "shutdown timed out");
                std::process::exit(1);
            }
        }
    }
}

fn release(pools: Option<&WorkerPoolManager>, registry: &TaskRegistry) -> anyhow::Result<()> {
    if let Some(pools) = pools {
        pools.release_all();
    }
    registry
        .release()
        .with_context(|| format!("releasing task registry {}", registry.path().display()))
}

/// Builder for [`ServiceContext`]. Every dependency defaults to the
/// production implementation derived from the [`ServiceConfig`].
pub struct ServiceContextBuilder {
    config: ServiceConfig,
    registry: Option<Arc<TaskRegistry>>,
    completion_log: Option<Arc<dyn CompletionLog>>,
    admission: Option<Arc<dyn Admission>>,
    pools: Option<Arc<WorkerPoolManager>>,
    executor: Option<Arc<dyn JobExecutor>>,
}

impl fmt::Debug for ServiceContextBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ServiceContextBuilder");
        debug.field("config", &self.config);
        debug.field("registry_set", &self.registry.is_some());
        debug.field("completion_log_set", &self.completion_log.is_some());
        debug.field("admission_set", &self.admission.is_some());
        debug.field("pools_set", &self.pools.is_some());
        debug.field("executor_set", &self.executor.is_some());
        debug.finish()
    }
}

impl ServiceContextBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            registry: None,
            completion_log: None,
            admission: None,
            pools: None,
            executor: None,
        }
    }

    /// Use an already opened registry instead of creating one.
    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Completion log for a registry created by the builder.
    pub fn with_completion_log(mut self, log: Arc<dyn CompletionLog>) -> Self {
        self.completion_log = Some(log);
        self
    }

    pub fn with_admission(mut self, admission: Arc<dyn Admission>) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn with_pool(mut self, pools: Arc<WorkerPoolManager>) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Dispatch jobs through `executor` instead of the worker pool.
    pub fn with_executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> anyhow::Result<ServiceContext> {
        let config = self.config;

        let registry = match self.registry {
            Some(registry) => registry,
            None => {
                let log: Arc<dyn CompletionLog> = match (self.completion_log, &config.completion_log_dir) {
                    (Some(log), _) => log,
                    (None, Some(dir)) => Arc::new(JsonlCompletionLog::open(dir)?),
                    (None, None) => Arc::new(NoopCompletionLog),
                };
                let registry = TaskRegistry::create(&config.registry, log).with_context(|| {
                    format!("creating task registry {}", config.registry.path.display())
                })?;
                Arc::new(registry)
            }
        };

        let (executor, pools): (Arc<dyn JobExecutor>, _) = match (self.executor, self.pools) {
            (Some(executor), pools) => (executor, pools),
            (None, Some(pools)) => (pools.clone() as Arc<dyn JobExecutor>, Some(pools)),
            (None, None) => {
                let pools = Arc::new(WorkerPoolManager::new(config.pool.clone()));
                (pools.clone() as Arc<dyn JobExecutor>, Some(pools))
            }
        };

        let admission = self.admission.unwrap_or_else(|| {
            Arc::new(SemaphoreAdmission::new(config.admission.resolve(config.pool.workers)))
        });

        let orchestrator = TaskOrchestrator::new(
            config.orchestrator.clone(),
            registry.clone(),
            executor,
            admission.clone(),
        )
        .with_output_display_len(config.registry.output_display_len)
        .with_completion_log_dir(config.completion_log_dir.clone());

        tracing::info!(
            registry = %registry.path().display(),
            slots = registry.max_items(),
            permits = admission.capacity(),
            workers = config.pool.workers,
            "service context ready"
        );

        Ok(ServiceContext {
            config,
            registry,
            admission,
            pools,
            orchestrator,
        })
    }
}
