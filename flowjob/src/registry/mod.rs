//! Host-wide table of in-flight tasks.
//!
//! The [`TaskRegistry`] is a fixed number of slots in a region file shared by
//! every server and worker process on the host. Each slot holds either a
//! sentinel (free) or one [`TaskRecord`]. All mutations run under the region
//! lock and replace a whole slot at once.
//!
//! Server processes attach with [`TaskRegistry::create`], which initializes
//! the region only when no other process has done so. The region is removed
//! when the last attached server releases it.
//!
//! Lock acquisition is bounded. When the lock cannot be taken in time the
//! boolean operations return `false` and the listing operations return an
//! empty snapshot rather than blocking the caller.

mod lock;
mod slot;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::completion::{CompletionEntry, CompletionLog, NoopCompletionLog};
use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::job::{status, TaskId, WorkerContext};

use lock::{Region, RegionGuard};
pub use slot::{display_path, now_millis, Slot, TaskRecord, MAX_SLOTS, SLOT_SIZE};

/// Why a record could not be claimed.
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("task `{0}` is already registered")]
    Duplicate(TaskId),
    #[error("no free registry slot")]
    Full,
    #[error(transparent)]
    Unavailable(#[from] RegistryError),
}

/// Per-category slot tally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotCounts {
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub empty: usize,
}

impl SlotCounts {
    /// Counts reported when the registry could not be read.
    pub fn unavailable(max_items: usize) -> Self {
        Self {
            empty: max_items,
            ..Self::default()
        }
    }

    fn tally(&mut self, slot: &Slot) {
        match slot.status() {
            "completed" => self.completed += 1,
            "failed" => self.failed += 1,
            status::EMPTY => self.empty += 1,
            _ => self.running += 1,
        }
    }

    pub fn as_map(&self) -> BTreeMap<&'static str, usize> {
        BTreeMap::from([
            ("running", self.running),
            ("completed", self.completed),
            ("failed", self.failed),
            ("empty", self.empty),
        ])
    }
}

/// Handle on the shared task registry region.
pub struct TaskRegistry {
    path: PathBuf,
    max_items: usize,
    lock_timeout: Duration,
    region: Mutex<Region>,
    completion_log: Arc<dyn CompletionLog>,
    /// Holds one of the region's attachments until released.
    attached: AtomicBool,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("path", &self.path)
            .field("max_items", &self.max_items)
            .field("lock_timeout", &self.lock_timeout)
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl TaskRegistry {
    /// Attach to the host's region at `config.path`, creating it with every
    /// slot free if it does not exist yet.
    ///
    /// An existing region keeps its records and its slot count. The handle
    /// counts as attached until [`release`](Self::release).
    pub fn create(
        config: &RegistryConfig,
        completion_log: Arc<dyn CompletionLog>,
    ) -> Result<Self, RegistryError> {
        let (region, created) =
            Region::open_or_create(&config.path, config.max_items, config.lock_timeout())?;
        if created {
            tracing::info!(
                path = %config.path.display(),
                max_items = config.max_items,
                "task registry created"
            );
        } else {
            if region.max_items() != config.max_items {
                tracing::warn!(
                    path = %config.path.display(),
                    configured = config.max_items,
                    existing = region.max_items(),
                    "attached to a registry with a different slot count"
                );
            }
            tracing::info!(path = %config.path.display(), "attached to existing task registry");
        }
        Ok(Self {
            path: config.path.clone(),
            max_items: region.max_items(),
            lock_timeout: config.lock_timeout(),
            region: Mutex::new(region),
            completion_log,
            attached: AtomicBool::new(true),
        })
    }

    /// Attach to a region created by another handle or process.
    pub fn open(
        path: impl AsRef<Path>,
        lock_timeout: Duration,
        completion_log: Arc<dyn CompletionLog>,
    ) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let region = Region::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            max_items: region.max_items(),
            lock_timeout,
            region: Mutex::new(region),
            completion_log,
            attached: AtomicBool::new(false),
        })
    }

    /// Attach with no completion log, for read-only inspection.
    pub fn open_readonly(path: impl AsRef<Path>, lock_timeout: Duration) -> Result<Self, RegistryError> {
        Self::open(path, lock_timeout, Arc::new(NoopCompletionLog))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Whether this handle still holds an attachment on the region.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// What a worker process needs to reach this registry.
    pub fn worker_context(&self, completion_log_dir: Option<PathBuf>) -> WorkerContext {
        WorkerContext {
            registry_path: self.path.clone(),
            lock_timeout_ms: self.lock_timeout.as_millis() as u64,
            completion_log_dir,
        }
    }

    fn lock(&self) -> Result<RegionGuard<'_>, RegistryError> {
        lock::lock(&self.region, self.lock_timeout)
    }

    /// Claim the first free slot for `record`.
    ///
    /// One pass over the table both checks for a live record with the same
    /// id and finds the first sentinel, so a duplicate is reported even when
    /// the table is also full.
    pub fn claim(&self, record: &TaskRecord) -> Result<usize, ClaimError> {
        let guard = self.lock()?;
        let slots = guard.read_all()?;

        let mut free = None;
        for (index, slot) in slots.iter().enumerate() {
            if slot.holds(&record.task_id) {
                return Err(ClaimError::Duplicate(record.task_id.clone()));
            }
            if free.is_none() && matches!(slot, Slot::Sentinel) {
                free = Some(index);
            }
        }

        let index = free.ok_or(ClaimError::Full)?;
        guard.write(index, &Slot::Occupied(record.clone()))?;
        tracing::debug!(task_id = %record.task_id, slot = index, "task registered");
        Ok(index)
    }

    /// Boolean form of [`claim`](Self::claim).
    pub fn add(&self, record: &TaskRecord) -> bool {
        match self.claim(record) {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(task_id = %record.task_id, "task not registered: {err}");
                false
            }
        }
    }

    /// Rewrite the status and `updated_at` of the task's slot.
    pub fn update_status(&self, task_id: &TaskId, status: &str) -> bool {
        let result = self.with_task(task_id, |guard, index, mut record| {
            record.touch(status);
            guard.write(index, &Slot::Occupied(record))
        });
        self.settle("update_status", task_id, result)
    }

    /// Append the task's final record to the completion log, then free its
    /// slot. Returns `false` if the task holds no slot.
    pub fn complete(&self, task_id: &TaskId, success: bool) -> bool {
        let result = self.with_task(task_id, |guard, index, record| {
            let entry = CompletionEntry::new(record, success);
            if let Err(err) = self.completion_log.append(&entry) {
                tracing::warn!(%task_id, "completion log append failed: {err:#}");
            }
            guard.write(index, &Slot::Sentinel)
        });
        self.settle("complete", task_id, result)
    }

    /// Snapshot of one task's record.
    pub fn get(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.snapshot()
            .into_iter()
            .find(|slot| slot.holds(task_id))
            .and_then(|slot| match slot {
                Slot::Occupied(record) => Some(record),
                Slot::Sentinel => None,
            })
    }

    /// Every occupied slot, in slot order.
    pub fn list_active(&self) -> Vec<TaskRecord> {
        self.snapshot()
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Occupied(record) => Some(record),
                Slot::Sentinel => None,
            })
            .collect()
    }

    /// Every slot including sentinels, in slot order. Empty when the
    /// registry could not be read.
    pub fn snapshot(&self) -> Vec<Slot> {
        match self.lock().and_then(|guard| guard.read_all()) {
            Ok(slots) => slots,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), "registry snapshot failed: {err}");
                Vec::new()
            }
        }
    }

    pub fn counts(&self) -> SlotCounts {
        match self.lock().and_then(|guard| guard.read_all()) {
            Ok(slots) => {
                let mut counts = SlotCounts::default();
                for slot in &slots {
                    counts.tally(slot);
                }
                counts
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), "registry counts unavailable: {err}");
                SlotCounts::unavailable(self.max_items)
            }
        }
    }

    /// Give up this handle's attachment. The last attached handle on the
    /// host removes the region file. Calling it again is a no-op.
    pub fn release(&self) -> Result<(), RegistryError> {
        if !self.attached.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let guard = self.lock()?;
        let remaining = guard.detach()?;
        if remaining > 0 {
            tracing::info!(path = %self.path.display(), remaining, "detached from task registry");
            return Ok(());
        }
        // Unlinked while the file lock is held, so a concurrent attach
        // notices and starts a fresh region.
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "task registry released");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Run `f` on the slot holding `task_id`. `Ok(false)` if there is none.
    fn with_task<F>(&self, task_id: &TaskId, f: F) -> Result<bool, RegistryError>
    where
        F: FnOnce(&RegionGuard<'_>, usize, TaskRecord) -> Result<(), RegistryError>,
    {
        let guard = self.lock()?;
        let found = guard
            .read_all()?
            .into_iter()
            .enumerate()
            .find_map(|(index, slot)| match slot {
                Slot::Occupied(record) if &record.task_id == task_id => Some((index, record)),
                _ => None,
            });

        match found {
            Some((index, record)) => {
                f(&guard, index, record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn settle(&self, op: &'static str, task_id: &TaskId, result: Result<bool, RegistryError>) -> bool {
        match result {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(%task_id, op, "registry operation failed: {err}");
                false
            }
        }
    }
}
