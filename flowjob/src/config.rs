use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Default number of registry slots.
pub const DEFAULT_MAX_ITEMS: usize = 15;

/// Configuration for the shared task registry region.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Region file, normally on a tmpfs such as `/dev/shm`.
    pub path: PathBuf,
    /// Number of slots, i.e. the host-wide cap on registered tasks.
    pub max_items: usize,
    /// Bound on lock acquisition before an operation gives up.
    pub lock_timeout_ms: u64,
    /// Output paths longer than this are cut and suffixed with `...`.
    pub output_display_len: usize,
}

impl RegistryConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    pub fn with_lock_timeout(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/shm/flowjob-registry"),
            max_items: DEFAULT_MAX_ITEMS,
            lock_timeout_ms: 100,
            output_display_len: 50,
        }
    }
}

/// Configuration for the worker process pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Worker processes per pool.
    pub workers: usize,
    /// Executable started for each worker.
    pub program: PathBuf,
    /// Arguments that put the executable into worker mode.
    pub args: Vec<String>,
    /// Extra environment for worker processes.
    pub env: Vec<(String, String)>,
}

impl PoolConfig {
    /// Pool running `program` with the given arguments.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Self::default()
        }
    }

    /// Pool that re-executes the current binary in `worker` mode.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, vec!["worker".to_string()]))
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            program: PathBuf::from("flowjob"),
            args: vec!["worker".to_string()],
            env: Vec::new(),
        }
    }
}

/// Configuration for the per-process admission gate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Permits; `None` uses the pool's worker count.
    pub capacity: Option<usize>,
}

impl AdmissionConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
        }
    }

    /// Effective capacity for a pool of `workers` processes.
    pub fn resolve(&self, workers: usize) -> usize {
        self.capacity.unwrap_or(workers).max(1)
    }
}

/// Retry and timeout policy of the task orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// How long one attempt waits for an admission permit.
    pub admission_timeout_ms: u64,
    /// Pause before retrying after an admission timeout.
    pub retry_delay_ms: u64,
    /// Deadline for a dispatched job, if any.
    pub job_timeout_ms: Option<u64>,
}

impl OrchestratorConfig {
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_admission_timeout(mut self, ms: u64) -> Self {
        self.admission_timeout_ms = ms;
        self
    }

    pub fn with_retry_delay(mut self, ms: u64) -> Self {
        self.retry_delay_ms = ms;
        self
    }

    pub fn with_job_timeout(mut self, ms: u64) -> Self {
        self.job_timeout_ms = Some(ms);
        self
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            admission_timeout_ms: 30_000,
            retry_delay_ms: 1_000,
            job_timeout_ms: None,
        }
    }
}

/// Everything one server process needs to build its [`ServiceContext`].
///
/// [`ServiceContext`]: crate::runtime::ServiceContext
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub registry: RegistryConfig,
    pub pool: PoolConfig,
    pub admission: AdmissionConfig,
    pub orchestrator: OrchestratorConfig,
    /// Directory for the success/failure completion logs.
    pub completion_log_dir: Option<PathBuf>,
}

impl ServiceConfig {
    /// Read a JSON config file. Missing sections and fields take their
    /// defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// [`load`](Self::load) when a path is given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let registry = RegistryConfig::default();
        assert_eq!(registry.max_items, 15);
        assert_eq!(registry.lock_timeout(), Duration::from_millis(100));

        let orchestrator = OrchestratorConfig::default();
        assert_eq!(orchestrator.max_retries, 2);
        assert_eq!(orchestrator.admission_timeout(), Duration::from_secs(30));
        assert_eq!(orchestrator.retry_delay(), Duration::from_secs(1));
        assert!(orchestrator.job_timeout().is_none());
    }

    #[test]
    fn admission_capacity_follows_pool_size() {
        assert_eq!(AdmissionConfig::default().resolve(4), 4);
        assert_eq!(AdmissionConfig::with_capacity(1).resolve(4), 1);
        assert_eq!(AdmissionConfig::default().resolve(0), 1);
    }

    #[test]
    fn service_config_deserializes_from_json() {
        let raw = r#"{
            "registry": {"path": "/tmp/r", "max_items": 4, "lock_timeout_ms": 50, "output_display_len": 20},
            "pool": {"workers": 3, "program": "/usr/bin/flowjob", "args": ["worker"], "env": []},
            "admission": {"capacity": null},
            "orchestrator": {"max_retries": 1, "admission_timeout_ms": 10, "retry_delay_ms": 0, "job_timeout_ms": 500},
            "completion_log_dir": "/var/log/flowjob"
        }"#;
        let config: ServiceConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.registry.max_items, 4);
        assert_eq!(config.pool.workers, 3);
        assert_eq!(config.orchestrator.job_timeout(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn partial_config_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowjob.json");
        std::fs::write(&path, r#"{"registry": {"max_items": 4}, "pool": {"workers": 6}}"#).unwrap();

        let config = ServiceConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.registry.max_items, 4);
        assert_eq!(config.registry.lock_timeout_ms, 100);
        assert_eq!(config.pool.workers, 6);
        assert_eq!(config.pool.args, vec!["worker".to_string()]);
        assert_eq!(config.orchestrator.max_retries, 2);

        assert!(ServiceConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
