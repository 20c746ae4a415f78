use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::job::{JobReply, JobRequest};

/// Pids of the live worker processes spawned by one pool.
///
/// A pid stays in the set only while its `Child` handle is alive and not
/// yet waited on, so the process cannot have been reaped and the pid
/// cannot have been reused by an unrelated process.
#[derive(Debug, Default)]
pub(crate) struct LiveSet {
    pids: Mutex<HashSet<u32>>,
}

impl LiveSet {
    pub(crate) fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.pids.lock().iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub(crate) fn len(&self) -> usize {
        self.pids.lock().len()
    }

    /// SIGKILL the process group of every tracked worker, so helpers a
    /// worker started die with it. Returns how many groups were signalled.
    pub(crate) fn kill_all(&self) -> usize {
        let pids = self.pids.lock();
        pids.iter().filter(|&&pid| kill_group(pid)).count()
    }

    fn insert(&self, pid: u32) {
        self.pids.lock().insert(pid);
    }

    fn remove(&self, pid: u32) {
        self.pids.lock().remove(&pid);
    }
}

/// SIGKILL the process group led by worker `pid`.
fn kill_group(pid: u32) -> bool {
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(pid, "killpg failed: {err}");
            false
        }
    }
}

/// One long-lived worker child speaking newline-delimited JSON.
///
/// Each worker leads its own process group; the group is killed when the
/// worker is dropped.
pub(crate) struct WorkerProcess {
    pid: u32,
    // Held for kill_on_drop.
    _child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    live: Arc<LiveSet>,
    busy: bool,
}

impl WorkerProcess {
    pub(crate) fn spawn(config: &PoolConfig, live: Arc<LiveSet>) -> Result<Self, PoolError> {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(PoolError::Spawn)?;
        let pid = child
            .id()
            .ok_or_else(|| PoolError::Broken("worker exited before it could be tracked".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Protocol("worker stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Protocol("worker stdout not piped".into()))?;

        live.insert(pid);
        Ok(Self {
            pid,
            _child: child,
            stdin,
            stdout: BufReader::new(stdout),
            live,
            busy: false,
        })
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Send one request and wait for its reply line.
    ///
    /// Any failure leaves the worker in an unknown state; the caller must
    /// drop it rather than reuse it.
    pub(crate) async fn roundtrip(&mut self, request: &JobRequest) -> Result<JobReply, PoolError> {
        let mut line =
            serde_json::to_string(request).map_err(|e| PoolError::Protocol(e.to_string()))?;
        line.push('\n');

        self.busy = true;
        let pid = self.pid;
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| PoolError::Broken(format!("worker {pid} stdin closed: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| PoolError::Broken(format!("worker {pid} stdin closed: {e}")))?;

        let mut reply = String::new();
        let read = self
            .stdout
            .read_line(&mut reply)
            .await
            .map_err(|e| PoolError::Broken(format!("worker {pid} stdout failed: {e}")))?;
        if read == 0 {
            return Err(PoolError::Broken(format!("worker {pid} exited mid-job")));
        }

        let reply = serde_json::from_str(reply.trim_end())
            .map_err(|e| PoolError::Broken(format!("worker {pid} sent a malformed reply: {e}")))?;
        self.busy = false;
        Ok(reply)
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.busy {
            tracing::warn!(pid = self.pid, "worker abandoned mid-job, killing");
        }
        // The child is not reaped until `_child` drops, so the group id
        // cannot have been reused yet.
        kill_group(self.pid);
        self.live.remove(self.pid);
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.pid)
            .field("busy", &self.busy)
            .finish_non_exhaustive()
    }
}
