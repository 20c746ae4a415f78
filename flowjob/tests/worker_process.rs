//! End-to-end tests that run the `flowjob` binary as pool workers and as a
//! command-line tool.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use flowjob::{
    PoolConfig, ServiceConfig, ServiceContextBuilder, TaskId, TaskRecord, TaskResult,
    TerminalStatus, WorkerPoolManager,
};
use flowjob_testkit::{submission, TempRegistry};
use tokio::time::timeout;

const BIN: &str = env!("CARGO_BIN_EXE_flowjob");

fn worker_pool(workers: usize) -> PoolConfig {
    PoolConfig::new(
        BIN,
        vec![
            "worker".to_string(),
            "--step-delay-ms".to_string(),
            "0".to_string(),
        ],
    )
    .with_workers(workers)
}

#[tokio::test]
async fn concurrent_tasks_complete_on_real_workers() {
    let fixture = TempRegistry::new(4);
    let pools = Arc::new(WorkerPoolManager::new(worker_pool(2)));
    let config = ServiceConfig {
        registry: fixture.config().clone(),
        pool: worker_pool(2),
        ..ServiceConfig::default()
    };
    let context = Arc::new(
        ServiceContextBuilder::new(config)
            .with_registry(fixture.registry())
            .with_pool(pools.clone())
            .build()
            .unwrap(),
    );

    let tasks: Vec<_> = ["alpha", "beta", "gamma"]
        .into_iter()
        .map(|id| {
            let context = context.clone();
            tokio::spawn(async move { context.submit(submission(id, 2)).await })
        })
        .collect();

    let results = timeout(Duration::from_secs(30), futures::future::join_all(tasks))
        .await
        .unwrap();
    for result in results {
        let result = result.unwrap();
        assert_eq!(result.status, TerminalStatus::Completed, "{result:?}");
        assert_eq!(result.summary.unwrap().files_processed, 2);
    }

    assert!(fixture.registry().list_active().is_empty());
    assert_eq!(pools.generation(), 1);
    let live = pools.executor().live_workers();
    assert!(!live.is_empty() && live.len() <= 2);

    context.shutdown().unwrap();
    assert!(pools.executor().live_workers().is_empty());
}

#[test]
fn export_command_prints_a_completed_result_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let registry = dir.path().join("registry");
    let logs = dir.path().join("logs");

    let output = Command::new(BIN)
        .args(["export", "--output", "/exports/cli.ipfix", "--task-id", "cli-task"])
        .args(["--dpi", "--analysis", "top_talkers"])
        .arg("--registry")
        .arg(&registry)
        .arg("--completion-log-dir")
        .arg(&logs)
        .args(["--workers", "1", "--step-delay-ms", "0"])
        .args(["/captures/a.pcap", "/captures/b.pcap"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let result: TaskResult = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result.status, TerminalStatus::Completed);
    assert_eq!(result.task_id, "cli-task");

    assert!(!registry.exists());
    let successes = std::fs::read_to_string(logs.join("successful_tasks.jsonl")).unwrap();
    assert_eq!(successes.lines().count(), 1);
    assert!(successes.contains(r#""task_id":"cli-task""#));
}

#[test]
fn export_command_exits_nonzero_on_rejection() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(BIN)
        .args(["export", "--output", "/exports/x.ipfix", "--task-id", "#reserved"])
        .arg("--registry")
        .arg(dir.path().join("registry"))
        .arg("/captures/a.pcap")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    let result: TaskResult = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result.status, TerminalStatus::Rejected);
}

#[test]
fn status_command_lists_active_tasks() {
    let fixture = TempRegistry::new(3);
    fixture.registry().add(
        &TaskRecord::new(TaskId::parse("visible").unwrap(), 4, "/exports/v.ipfix", 50)
            .with_status("step_2_parsing_packets"),
    );

    let output = Command::new(BIN)
        .arg("status")
        .arg("--registry")
        .arg(fixture.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["max_items"], 3);
    assert_eq!(report["counts"]["running"], 1);
    assert_eq!(report["counts"]["empty"], 2);
    assert_eq!(report["active"][0]["task_id"], "visible");
    assert_eq!(report["active"][0]["file_count"], 4);
    assert_eq!(
        report["slots"],
        serde_json::json!(["visible", "#empty_slot_1", "#empty_slot_2"])
    );
}

#[test]
fn status_command_fails_without_a_region() {
    let missing = PathBuf::from("/nonexistent/flowjob-registry");
    let output = Command::new(BIN)
        .arg("status")
        .arg("--registry")
        .arg(&missing)
        .output()
        .unwrap();
    assert!(!output.status.success());
}
