//! Append-only audit trail of finished tasks.
//!
//! Every terminal task produces exactly one entry in one of two streams,
//! successes or failures. Entries are written by the registry at the moment
//! the task's slot is freed. Nothing in the orchestration path reads them
//! back; [`CompletionLog::recent`] exists for operational inspection.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::TaskRecord;

pub const SUCCESS_LOG_FILE: &str = "successful_tasks.jsonl";
pub const FAILURE_LOG_FILE: &str = "failed_tasks.jsonl";

/// Which of the two streams an entry belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStream {
    Success,
    Failure,
}

impl CompletionStream {
    pub fn for_outcome(success: bool) -> Self {
        if success {
            Self::Success
        } else {
            Self::Failure
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Self::Success => SUCCESS_LOG_FILE,
            Self::Failure => FAILURE_LOG_FILE,
        }
    }
}

/// Final record of a task plus when and how it ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEntry {
    #[serde(flatten)]
    pub record: TaskRecord,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
}

impl CompletionEntry {
    pub fn new(record: TaskRecord, success: bool) -> Self {
        Self {
            record,
            success,
            completed_at: Utc::now(),
        }
    }

    pub fn stream(&self) -> CompletionStream {
        CompletionStream::for_outcome(self.success)
    }
}

/// Sink for completion entries.
pub trait CompletionLog: Send + Sync + fmt::Debug {
    /// Append one entry to the stream matching its outcome.
    fn append(&self, entry: &CompletionEntry) -> anyhow::Result<()>;

    /// Last `max_entries` entries of one stream, oldest first.
    fn recent(
        &self,
        stream: CompletionStream,
        max_entries: usize,
    ) -> anyhow::Result<Vec<CompletionEntry>>;
}

/// Discards every entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCompletionLog;

impl CompletionLog for NoopCompletionLog {
    fn append(&self, _entry: &CompletionEntry) -> anyhow::Result<()> {
        Ok(())
    }

    fn recent(
        &self,
        _stream: CompletionStream,
        _max_entries: usize,
    ) -> anyhow::Result<Vec<CompletionEntry>> {
        Ok(Vec::new())
    }
}

/// JSON-lines files, one per stream, in a single directory.
///
/// Each append opens the file in append mode and writes a whole line in
/// one call, so concurrent writers from several processes do not interleave
/// partial lines.
#[derive(Clone, Debug)]
pub struct JsonlCompletionLog {
    dir: PathBuf,
}

impl JsonlCompletionLog {
    /// Use `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating completion log dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, stream: CompletionStream) -> PathBuf {
        self.dir.join(stream.file_name())
    }
}

impl CompletionLog for JsonlCompletionLog {
    fn append(&self, entry: &CompletionEntry) -> anyhow::Result<()> {
        let path = self.path_for(entry.stream());
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("appending to {}", path.display()))?;

        tracing::info!(
            task_id = %entry.record.task_id,
            success = entry.success,
            "task completion logged"
        );
        Ok(())
    }

    fn recent(
        &self,
        stream: CompletionStream,
        max_entries: usize,
    ) -> anyhow::Result<Vec<CompletionEntry>> {
        let path = self.path_for(stream);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file =
            fs::File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CompletionEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => tracing::warn!(path = %path.display(), "skipping bad completion line: {err}"),
            }
        }

        let skip = entries.len().saturating_sub(max_entries);
        Ok(entries.split_off(skip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TaskId;

    fn record(id: &str) -> TaskRecord {
        TaskRecord::new(TaskId::parse(id).unwrap(), 2, "/data/out.ipfix", 50)
    }

    #[test]
    fn entries_land_in_the_stream_matching_their_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlCompletionLog::open(dir.path().join("logs")).unwrap();

        log.append(&CompletionEntry::new(record("ok-1"), true)).unwrap();
        log.append(&CompletionEntry::new(record("bad-1"), false)).unwrap();
        log.append(&CompletionEntry::new(record("ok-2"), true)).unwrap();

        let ok = log.recent(CompletionStream::Success, 10).unwrap();
        let ids: Vec<&str> = ok.iter().map(|e| e.record.task_id.as_str()).collect();
        assert_eq!(ids, vec!["ok-1", "ok-2"]);

        let failed = log.recent(CompletionStream::Failure, 10).unwrap();
        assert_eq!(failed.len(), 1);
        assert!(!failed[0].success);
    }

    #[test]
    fn recent_keeps_only_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlCompletionLog::open(dir.path()).unwrap();
        for i in 0..5 {
            log.append(&CompletionEntry::new(record(&format!("t{i}")), true))
                .unwrap();
        }

        let tail = log.recent(CompletionStream::Success, 2).unwrap();
        let ids: Vec<&str> = tail.iter().map(|e| e.record.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t3", "t4"]);
    }

    #[test]
    fn missing_stream_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlCompletionLog::open(dir.path()).unwrap();
        assert!(log.recent(CompletionStream::Failure, 10).unwrap().is_empty());
    }

    #[test]
    fn entry_line_flattens_the_record() {
        let entry = CompletionEntry::new(record("flat"), true);
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["task_id"], "flat");
        assert_eq!(value["file_count"], 2);
        assert_eq!(value["success"], true);
    }
}
