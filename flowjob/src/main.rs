mod cli;

use std::io::{self, BufWriter};
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands, ExportArgs};
use flowjob::{
    worker, ExecutionHandler, ExportSubmission, JobParams, PoolConfig, ServiceConfig,
    ServiceContextBuilder, SimulatedPipeline, TaskRegistry,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "flowjob=debug".to_string()
        } else {
            "flowjob=info".to_string()
        }
    });

    // stdout carries worker replies and JSON results; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(io::stderr)
        .init();

    #[cfg(feature = "metrics")]
    flowjob::metrics::init_metrics()?;

    match cli.command {
        Commands::Worker { step_delay_ms } => run_worker(step_delay_ms),
        Commands::Status {
            registry,
            lock_timeout_ms,
        } => show_status(cli.config.as_deref(), registry, lock_timeout_ms),
        Commands::Export(args) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(export(cli.config.as_deref(), args))
        }
    }
}

fn run_worker(step_delay_ms: u64) -> Result<()> {
    let handler = ExecutionHandler::new(SimulatedPipeline::new(Duration::from_millis(step_delay_ms)));
    let stdin = io::stdin();
    let stdout = io::stdout();
    let served = worker::serve(&handler, stdin.lock(), BufWriter::new(stdout.lock()))?;
    tracing::debug!(served, pid = std::process::id(), "worker exiting");
    Ok(())
}

fn show_status(
    config_path: Option<&Path>,
    registry: Option<std::path::PathBuf>,
    lock_timeout_ms: Option<u64>,
) -> Result<()> {
    let mut config = ServiceConfig::load_or_default(config_path)?.registry;
    if let Some(path) = registry {
        config.path = path;
    }
    if let Some(ms) = lock_timeout_ms {
        config.lock_timeout_ms = ms;
    }

    let registry = TaskRegistry::open_readonly(&config.path, config.lock_timeout())?;
    let labels: Vec<String> = registry
        .snapshot()
        .iter()
        .enumerate()
        .map(|(index, slot)| slot.label(index))
        .collect();
    let report = serde_json::json!({
        "registry": config.path,
        "max_items": registry.max_items(),
        "counts": registry.counts().as_map(),
        "slots": labels,
        "active": registry.list_active(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn export(config_path: Option<&Path>, args: ExportArgs) -> Result<()> {
    let mut config = ServiceConfig::load_or_default(config_path)?;
    if let Some(path) = args.registry {
        config.registry.path = path;
    }
    if let Some(max_items) = args.max_items {
        config.registry.max_items = max_items;
    }
    if config_path.is_none() {
        config.pool = PoolConfig::current_exe()?;
    }
    if let Some(workers) = args.workers {
        config.pool.workers = workers;
    }
    if let Some(ms) = args.step_delay_ms {
        config.pool.args.push("--step-delay-ms".to_string());
        config.pool.args.push(ms.to_string());
    }
    if args.completion_log_dir.is_some() {
        config.completion_log_dir = args.completion_log_dir;
    }

    let context = ServiceContextBuilder::new(config).build()?;

    let mut params = JobParams::default().with_deep_inspection(args.dpi);
    params.task_id = args.task_id;
    for analysis in args.analyses {
        params = params.with_analysis(analysis);
    }
    let submission = ExportSubmission::new(args.files, args.output).with_params(params);

    let result = context.submit(submission).await;
    println!("{}", serde_json::to_string(&result)?);

    context.shutdown_or_exit(Duration::from_millis(args.shutdown_timeout_ms));
    if !result.is_completed() {
        std::process::exit(2);
    }
    Ok(())
}
