use flowjob::{CompletionEntry, CompletionLog, CompletionStream};
use parking_lot::Mutex;
use std::sync::Arc;

/// Keeps completion entries in memory, in append order.
#[derive(Clone, Debug, Default)]
pub struct MemoryCompletionLog {
    entries: Arc<Mutex<Vec<CompletionEntry>>>,
}

impl MemoryCompletionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<CompletionEntry> {
        self.entries.lock().clone()
    }

    pub fn successes(&self) -> Vec<CompletionEntry> {
        self.of(CompletionStream::Success)
    }

    pub fn failures(&self) -> Vec<CompletionEntry> {
        self.of(CompletionStream::Failure)
    }

    /// Entries logged for `task_id` across both streams.
    pub fn for_task(&self, task_id: &str) -> Vec<CompletionEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.record.task_id.as_str() == task_id)
            .cloned()
            .collect()
    }

    fn of(&self, stream: CompletionStream) -> Vec<CompletionEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.stream() == stream)
            .cloned()
            .collect()
    }
}

impl CompletionLog for MemoryCompletionLog {
    fn append(&self, entry: &CompletionEntry) -> anyhow::Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    fn recent(
        &self,
        stream: CompletionStream,
        max_entries: usize,
    ) -> anyhow::Result<Vec<CompletionEntry>> {
        let matching = self.of(stream);
        let skip = matching.len().saturating_sub(max_entries);
        Ok(matching.into_iter().skip(skip).collect())
    }
}
