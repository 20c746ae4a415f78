//! Worker processes that execute conversion jobs.
//!
//! A [`WorkerPool`] owns up to `workers` child processes and hands each job
//! to an idle one. When a worker dies or breaks the reply protocol mid-job
//! the pool marks itself broken and refuses further work. The
//! [`WorkerPoolManager`] replaces a broken pool on next access and is the
//! only thing that ever creates or tears down pools.

mod process;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::Instrument;

use crate::config::PoolConfig;
use crate::error::{ExecutionError, PoolError};
use crate::job::{ExportSummary, JobReply, JobRequest};
use crate::telemetry;

use process::{LiveSet, WorkerProcess};

/// Runs a job somewhere and reports its typed outcome.
///
/// [`WorkerPoolManager`] is the production implementation; tests substitute
/// scripted executors.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, request: JobRequest) -> Result<ExportSummary, ExecutionError>;
}

/// Bounded set of worker processes plus a liveness flag.
pub struct WorkerPool {
    generation: u64,
    config: PoolConfig,
    idle: Mutex<Vec<WorkerProcess>>,
    slots: Semaphore,
    live: Arc<LiveSet>,
    broken: AtomicBool,
    closed: AtomicBool,
    /// Closed because the manager replaced it, not because of shutdown.
    superseded: AtomicBool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("generation", &self.generation)
            .field("workers", &self.config.workers)
            .field("live", &self.live.len())
            .field("broken", &self.is_broken())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl WorkerPool {
    /// Pool of `config.workers` processes, spawned on first use.
    pub fn new(config: PoolConfig, generation: u64) -> Self {
        let workers = config.workers.max(1);
        Self {
            generation,
            config,
            idle: Mutex::new(Vec::with_capacity(workers)),
            slots: Semaphore::new(workers),
            live: Arc::new(LiveSet::default()),
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            superseded: AtomicBool::new(false),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Pids of the processes this pool spawned and still tracks.
    pub fn live_workers(&self) -> Vec<u32> {
        self.live.pids()
    }

    /// Why a closed pool refuses work. A replaced pool reports itself
    /// broken so the job is retried on its successor.
    fn closed_error(&self) -> PoolError {
        if self.superseded.load(Ordering::Acquire) {
            PoolError::Broken(format!("pool generation {} was replaced", self.generation))
        } else {
            PoolError::Shutdown
        }
    }

    fn mark_broken(&self, reason: &PoolError) {
        if !self.broken.swap(true, Ordering::AcqRel) {
            tracing::error!(generation = self.generation, "worker pool broken: {reason}");
        }
    }

    /// Run `request` on an idle worker, spawning one if none is idle.
    ///
    /// If the returned future is dropped mid-job the worker is killed and
    /// the slot freed; the pool stays healthy and spawns a replacement on
    /// demand.
    pub async fn submit(&self, request: &JobRequest) -> Result<JobReply, PoolError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if self.is_broken() {
            return Err(PoolError::Broken(format!(
                "pool generation {} is broken",
                self.generation
            )));
        }

        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| self.closed_error())?;
        let idle = self.idle.lock().pop();
        let mut worker = match idle {
            Some(worker) => worker,
            None => {
                let worker = WorkerProcess::spawn(&self.config, self.live.clone())?;
                telemetry::record_worker_spawned(self.generation, worker.pid());
                worker
            }
        };

        let span = telemetry::pool_submit_span(&request.task_id, self.generation);
        span.record("pid", worker.pid());
        match worker.roundtrip(request).instrument(span).await {
            Ok(reply) => {
                if !self.is_closed() {
                    self.idle.lock().push(worker);
                }
                Ok(reply)
            }
            Err(err) => {
                self.mark_broken(&err);
                Err(err)
            }
        }
    }

    /// SIGKILL every process this pool spawned. Returns how many were
    /// signalled.
    pub fn kill_children(&self) -> usize {
        self.live.kill_all()
    }

    /// Stop accepting work and drop idle workers without waiting for jobs
    /// in flight.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slots.close();
        let idle: Vec<WorkerProcess> = std::mem::take(&mut *self.idle.lock());
        tracing::debug!(
            generation = self.generation,
            idle = idle.len(),
            "worker pool shut down"
        );
    }
}

/// Owns the current pool and every pool it has ever created.
pub struct WorkerPoolManager {
    config: PoolConfig,
    current: Mutex<Arc<WorkerPool>>,
    history: Mutex<Vec<Arc<WorkerPool>>>,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for WorkerPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolManager")
            .field("config", &self.config)
            .field("generation", &self.generation())
            .field("pools", &self.history.lock().len())
            .finish()
    }
}

impl WorkerPoolManager {
    pub fn new(config: PoolConfig) -> Self {
        let first = Arc::new(WorkerPool::new(config.clone(), 1));
        Self {
            config,
            current: Mutex::new(first.clone()),
            history: Mutex::new(vec![first]),
            next_generation: AtomicU64::new(2),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Generation of the current pool. The first pool is generation 1.
    pub fn generation(&self) -> u64 {
        self.current.lock().generation()
    }

    /// The current pool, replaced first if it is broken.
    pub fn executor(&self) -> Arc<WorkerPool> {
        let mut current = self.current.lock();
        if current.is_broken() {
            *current = self.replace(&current);
        }
        current.clone()
    }

    /// Unconditionally tear down the current pool and start a fresh one.
    pub fn recreate(&self) -> Arc<WorkerPool> {
        let mut current = self.current.lock();
        *current = self.replace(&current);
        current.clone()
    }

    fn replace(&self, old: &WorkerPool) -> Arc<WorkerPool> {
        old.superseded.store(true, Ordering::Release);
        let killed = old.kill_children();
        old.shutdown();

        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel);
        let fresh = Arc::new(WorkerPool::new(self.config.clone(), generation));

        let mut history = self.history.lock();
        history.retain(|pool| !(pool.is_closed() && pool.live_workers().is_empty()));
        history.push(fresh.clone());

        telemetry::record_pool_recreated(generation, killed);
        fresh
    }

    /// Kill and shut down every pool this manager has created. Never fails;
    /// problems are logged.
    pub fn release_all(&self) {
        let pools: Vec<Arc<WorkerPool>> = self.history.lock().clone();
        let mut killed = 0;
        for pool in &pools {
            killed += pool.kill_children();
            pool.shutdown();
        }
        tracing::info!(pools = pools.len(), killed, "worker pools released");
    }
}

#[async_trait]
impl JobExecutor for WorkerPoolManager {
    async fn execute(&self, request: JobRequest) -> Result<ExportSummary, ExecutionError> {
        let pool = self.executor();
        match pool.submit(&request).await? {
            JobReply::Completed(summary) => Ok(summary),
            JobReply::Failed(failure) => Err(failure.into()),
        }
    }
}
