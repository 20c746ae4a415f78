use flowjob::{ExportSubmission, JobParams, RegistryConfig, TaskRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::MemoryCompletionLog;

/// Registry region in a temporary directory, removed on drop.
pub struct TempRegistry {
    dir: TempDir,
    config: RegistryConfig,
    registry: Arc<TaskRegistry>,
    log: MemoryCompletionLog,
}

impl TempRegistry {
    pub fn new(max_items: usize) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let config = RegistryConfig::new(dir.path().join("registry")).with_max_items(max_items);
        let log = MemoryCompletionLog::new();
        let registry =
            TaskRegistry::create(&config, Arc::new(log.clone())).expect("create task registry");
        Self {
            dir,
            config,
            registry: Arc::new(registry),
            log,
        }
    }

    pub fn registry(&self) -> Arc<TaskRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn log(&self) -> &MemoryCompletionLog {
        &self.log
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Scratch directory next to the region, e.g. for completion logs.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// A second handle on the same region, as another process would open it.
    pub fn reopen(&self) -> TaskRegistry {
        TaskRegistry::open_readonly(&self.config.path, self.config.lock_timeout())
            .expect("reopen task registry")
    }
}

/// Submission of `files` capture files under a fixed task id.
pub fn submission(task_id: &str, files: usize) -> ExportSubmission {
    let files: Vec<PathBuf> = (0..files)
        .map(|i| PathBuf::from(format!("/captures/{task_id}-{i}.pcap")))
        .collect();
    ExportSubmission::new(files, format!("/exports/{task_id}.ipfix"))
        .with_params(JobParams::default().with_task_id(task_id))
}
