//! Prometheus metrics for task orchestration.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `flowjob_tasks_finished_total` - terminal tasks by status and reason
//! - `flowjob_attempt_failures_total` - failed attempts by failure kind
//! - `flowjob_admission_total` - admission waits by outcome
//! - `flowjob_pool_recreations_total` - worker pools torn down and replaced
//! - `flowjob_workers_spawned_total` - worker processes started
//!
//! ## Gauges
//! - `flowjob_admission_permits_held` - permits currently handed out
//! - `flowjob_pool_generation` - generation of the current worker pool
//!
//! ## Histograms
//! - `flowjob_task_duration_seconds` - submission to terminal status
//! - `flowjob_admission_wait_seconds` - time spent waiting for a permit
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry,
};
use std::sync::LazyLock;

/// Registry holding every flowjob metric.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `status`, `reason` (empty for completed tasks).
pub static TASKS_FINISHED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let opts = Opts::new("flowjob_tasks_finished_total", "Tasks that reached a terminal status");
    IntCounterVec::new(opts, &["status", "reason"])
        .expect("flowjob_tasks_finished_total metric creation failed")
});

/// Labels: `kind` (broken_pool, process, timeout, coordination, failed).
pub static ATTEMPT_FAILURES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let opts = Opts::new("flowjob_attempt_failures_total", "Failed task attempts");
    IntCounterVec::new(opts, &["kind"])
        .expect("flowjob_attempt_failures_total metric creation failed")
});

/// Labels: `outcome` (granted, timed_out).
pub static ADMISSION_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let opts = Opts::new("flowjob_admission_total", "Admission waits by outcome");
    IntCounterVec::new(opts, &["outcome"]).expect("flowjob_admission_total metric creation failed")
});

pub static POOL_RECREATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("flowjob_pool_recreations_total", "Worker pools torn down and replaced")
        .expect("flowjob_pool_recreations_total metric creation failed")
});

pub static WORKERS_SPAWNED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("flowjob_workers_spawned_total", "Worker processes started")
        .expect("flowjob_workers_spawned_total metric creation failed")
});

pub static PERMITS_HELD: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("flowjob_admission_permits_held", "Admission permits currently held")
        .expect("flowjob_admission_permits_held metric creation failed")
});

pub static POOL_GENERATION: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("flowjob_pool_generation", "Generation of the current worker pool")
        .expect("flowjob_pool_generation metric creation failed")
});

/// Labels: `status`.
pub static TASK_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 16).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "flowjob_task_duration_seconds",
        "Time from submission to terminal status",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["status"]).expect("flowjob_task_duration_seconds metric creation failed")
});

/// Labels: `outcome`.
pub static ADMISSION_WAIT_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 16).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "flowjob_admission_wait_seconds",
        "Time spent waiting for an admission permit",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["outcome"])
        .expect("flowjob_admission_wait_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(TASKS_FINISHED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(ATTEMPT_FAILURES_TOTAL.clone()),
        Box::new(ADMISSION_TOTAL.clone()),
        Box::new(POOL_RECREATIONS_TOTAL.clone()),
        Box::new(WORKERS_SPAWNED_TOTAL.clone()),
        Box::new(PERMITS_HELD.clone()),
        Box::new(POOL_GENERATION.clone()),
        Box::new(TASK_DURATION_SECONDS.clone()),
        Box::new(ADMISSION_WAIT_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_task_finished(status: &str, reason: &str, duration_secs: f64) {
    TASKS_FINISHED_TOTAL.with_label_values(&[status, reason]).inc();
    TASK_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration_secs);
}

pub fn record_attempt_failure(kind: &str) {
    ATTEMPT_FAILURES_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_admission(granted: bool, wait_secs: f64) {
    let outcome = if granted { "granted" } else { "timed_out" };
    ADMISSION_TOTAL.with_label_values(&[outcome]).inc();
    ADMISSION_WAIT_SECONDS
        .with_label_values(&[outcome])
        .observe(wait_secs);
}

pub fn set_permits_held(held: usize) {
    PERMITS_HELD.set(held as i64);
}

pub fn record_pool_recreated(generation: u64) {
    POOL_RECREATIONS_TOTAL.inc();
    POOL_GENERATION.set(generation as i64);
}

pub fn record_worker_spawned() {
    WORKERS_SPAWNED_TOTAL.inc();
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization_is_idempotent() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_task_finished("completed", "", 0.25);
        record_task_finished("failed", "semaphore_timeout", 90.0);
        record_attempt_failure("broken_pool");
        record_admission(true, 0.002);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("flowjob_tasks_finished_total"));
        assert!(output.contains("flowjob_attempt_failures_total"));
        assert!(output.contains("flowjob_admission_wait_seconds"));
    }

    #[test]
    fn test_gauge_helpers() {
        set_permits_held(3);
        record_pool_recreated(7);
        record_worker_spawned();
    }
}
