//! Conduit CLI: run, inspect, and schedule batch pipelines.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Conduit: batch pipeline orchestration and validation
#[derive(Parser, Debug)]
#[command(name = "conduit", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run one pipeline now and wait for it to finish
    Run {
        /// Pipeline id
        pipeline_id: String,
        /// Items per batch for this run
        #[arg(long)]
        batch_size: Option<usize>,
        /// Stop after this many items
        #[arg(long)]
        max_items: Option<usize>,
        /// Run every validator instead of stopping at the first error
        #[arg(long)]
        lenient: bool,
        /// Run even if dependencies have not succeeded
        #[arg(long)]
        ignore_dependencies: bool,
    },
    /// Show run state of one or all pipelines
    Status {
        /// Pipeline id
        id: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List configured pipelines and why any were rejected
    List,
    /// Run the polling scheduler
    Scheduler {
        #[command(subcommand)]
        action: SchedulerAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum SchedulerAction {
    /// Start the scheduler in the foreground until Ctrl-C
    Start {
        /// Seconds between scheduler ticks
        #[arg(long)]
        tick_secs: Option<u64>,
        /// Pipelines allowed to run at the same time
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a starter configuration to the workspace
    Init,
    /// Print the merged configuration
    Show,
}

/// Exit code for configuration and usage errors.
const EXIT_CONFIG: u8 = 1;
/// Exit code for a run that finished `Failed`.
const EXIT_RUN_FAILED: u8 = 2;

fn init_tracing(verbose: u8, quiet: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let stderr_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    let log_dir = directories::ProjectDirs::from("dev", "conduit", "conduit")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let (json_layer, guard) = if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::daily(&log_dir, "conduit.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_filter(EnvFilter::new("debug"));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_CONFIG)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let _guard = init_tracing(cli.verbose, cli.quiet);

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    tracing::debug!(workspace = %workspace.display(), "Resolved workspace");

    match commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await {
        Ok(commands::Outcome::Success) => ExitCode::SUCCESS,
        Ok(commands::Outcome::RunFailed) => ExitCode::from(EXIT_RUN_FAILED),
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}
