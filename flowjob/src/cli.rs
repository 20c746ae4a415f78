use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flowjob")]
#[command(author, version, about = "Bulk capture-to-flow export orchestration")]
pub struct Cli {
    /// Path to a JSON service config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve jobs over stdin/stdout as a pool worker
    Worker {
        /// Simulated time spent on each pipeline step
        #[arg(long, default_value = "1000")]
        step_delay_ms: u64,
    },

    /// Show the active tasks and slot counts of a registry
    Status {
        /// Registry region file (overrides the config file)
        #[arg(long)]
        registry: Option<PathBuf>,

        /// Lock acquisition bound
        #[arg(long)]
        lock_timeout_ms: Option<u64>,
    },

    /// Convert a batch of capture files and print the task result as JSON
    Export(ExportArgs),
}

#[derive(Args)]
pub struct ExportArgs {
    /// Capture files, in processing order
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Destination of the flow-record output
    #[arg(short, long)]
    pub output: String,

    /// Caller-chosen task id; generated when absent
    #[arg(long)]
    pub task_id: Option<String>,

    /// Run deep packet inspection
    #[arg(long)]
    pub dpi: bool,

    /// Analysis to run over the output (repeatable)
    #[arg(long = "analysis")]
    pub analyses: Vec<String>,

    /// Registry region file (overrides the config file)
    #[arg(long)]
    pub registry: Option<PathBuf>,

    /// Registry slots when this process creates the region
    #[arg(long)]
    pub max_items: Option<usize>,

    /// Worker processes in the pool
    #[arg(long)]
    pub workers: Option<usize>,

    /// Simulated time spent by workers on each pipeline step
    #[arg(long)]
    pub step_delay_ms: Option<u64>,

    /// Directory for the success/failure completion logs
    #[arg(long)]
    pub completion_log_dir: Option<PathBuf>,

    /// Bound on cleanup before the process is forced to exit
    #[arg(long, default_value = "10000")]
    pub shutdown_timeout_ms: u64,
}
