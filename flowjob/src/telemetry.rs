//! Tracing spans and metric hooks for the task lifecycle.
//!
//! Every `record_*` helper logs through `tracing` and, with the `metrics`
//! feature enabled, also updates the matching Prometheus series in
//! [`crate::metrics`]. Without the feature they only log.
//!
//! # Spans
//!
//! - `flowjob.task` wraps one orchestrated submission
//! - `flowjob.attempt` wraps one admission + dispatch attempt
//! - `flowjob.pool.submit` wraps one round trip to a worker process
//! - `flowjob.worker.job` wraps pipeline execution inside a worker

use std::time::{Duration, Instant};

use tracing::{info_span, Span};

#[must_use]
pub fn task_span(task_id: impl AsRef<str>) -> Span {
    info_span!("flowjob.task", task_id = %task_id.as_ref())
}

#[must_use]
pub fn attempt_span(task_id: impl AsRef<str>, attempt: u32) -> Span {
    info_span!("flowjob.attempt", task_id = %task_id.as_ref(), attempt)
}

#[must_use]
pub fn pool_submit_span(task_id: impl AsRef<str>, generation: u64) -> Span {
    info_span!(
        "flowjob.pool.submit",
        task_id = %task_id.as_ref(),
        generation,
        pid = tracing::field::Empty,
    )
}

#[must_use]
pub fn worker_job_span(task_id: impl AsRef<str>) -> Span {
    info_span!("flowjob.worker.job", task_id = %task_id.as_ref())
}

/// Record the result of one admission wait.
pub fn record_admission(granted: bool, waited: Duration) {
    if granted {
        tracing::debug!(waited_ms = waited.as_millis() as u64, "admission granted");
    } else {
        tracing::warn!(waited_ms = waited.as_millis() as u64, "admission timed out");
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_admission(granted, waited.as_secs_f64());
}

/// Update the number of admission permits currently handed out.
pub fn record_permits_held(held: usize) {
    tracing::trace!(held, "admission permits held");

    #[cfg(feature = "metrics")]
    crate::metrics::set_permits_held(held);
}

/// Record a failed attempt and whether it will be retried.
pub fn record_attempt_failed(task_id: impl AsRef<str>, attempt: u32, kind: &str, retrying: bool) {
    tracing::warn!(
        task_id = %task_id.as_ref(),
        attempt,
        kind,
        retrying,
        "task attempt failed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_attempt_failure(kind);
}

/// Record that a pool was torn down and replaced.
pub fn record_pool_recreated(generation: u64, killed: usize) {
    tracing::warn!(generation, killed, "worker pool recreated");

    #[cfg(feature = "metrics")]
    crate::metrics::record_pool_recreated(generation);
}

pub fn record_worker_spawned(generation: u64, pid: u32) {
    tracing::debug!(generation, pid, "worker process spawned");

    #[cfg(feature = "metrics")]
    crate::metrics::record_worker_spawned();
}

/// Wall-clock timer for one orchestrated task.
#[derive(Debug)]
pub struct TaskTimer {
    task_id: String,
    start: Instant,
}

impl TaskTimer {
    pub fn start(task_id: impl AsRef<str>) -> Self {
        Self {
            task_id: task_id.as_ref().to_string(),
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Log the terminal status and observe the task duration.
    pub fn finish(self, status: &str, reason: Option<&str>) {
        let elapsed = self.start.elapsed();
        tracing::info!(
            task_id = %self.task_id,
            status,
            reason = reason.unwrap_or(""),
            elapsed_ms = elapsed.as_millis() as u64,
            "task finished"
        );

        #[cfg(feature = "metrics")]
        crate::metrics::record_task_finished(status, reason.unwrap_or(""), elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        // Spans are disabled (no metadata) unless a subscriber is installed.
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            assert_eq!(task_span("t1").metadata().unwrap().name(), "flowjob.task");
            assert_eq!(attempt_span("t1", 2).metadata().unwrap().name(), "flowjob.attempt");
            assert_eq!(
                pool_submit_span("t1", 3).metadata().unwrap().name(),
                "flowjob.pool.submit"
            );
            assert_eq!(
                worker_job_span("t1").metadata().unwrap().name(),
                "flowjob.worker.job"
            );
        });
    }

    #[test]
    fn test_task_timer() {
        let timer = TaskTimer::start("task-9");
        assert_eq!(timer.task_id(), "task-9");
        std::thread::sleep(Duration::from_millis(1));
        assert!(timer.elapsed() >= Duration::from_millis(1));
        timer.finish("failed", Some("task_timeout"));
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_admission(true, Duration::from_millis(3));
        record_admission(false, Duration::from_secs(30));
        record_permits_held(2);
        record_attempt_failed("t1", 1, "broken_pool", true);
        record_pool_recreated(2, 1);
        record_worker_spawned(2, 4242);
    }
}
