//! CLI subcommand handlers.

use crate::{Commands, ConfigAction, SchedulerAction};
use anyhow::{Context, bail};
use conduit_core::config::{self, ConduitConfig};
use conduit_core::manager::read_run_state;
use conduit_core::{
    ExecutionResult, PipelineManager, PipelineRunState, RunOverrides, SpecPipelineFactory,
    ValidationMode,
};
use std::path::Path;
use tracing::{info, warn};

/// How a successfully dispatched command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RunFailed,
}

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<Outcome> {
    match command {
        Commands::Run {
            pipeline_id,
            batch_size,
            max_items,
            lenient,
            ignore_dependencies,
        } => {
            let overrides = RunOverrides {
                batch_size,
                max_items,
                validation_mode: lenient.then_some(ValidationMode::Lenient),
                ignore_dependencies,
            };
            handle_run(&pipeline_id, overrides, workspace, config_path).await
        }
        Commands::Status { id, json } => handle_status(id.as_deref(), json, workspace, config_path),
        Commands::List => handle_list(workspace, config_path),
        Commands::Scheduler { action } => handle_scheduler(action, workspace, config_path).await,
        Commands::Config { action } => handle_config(action, workspace, config_path),
    }
}

fn load(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<ConduitConfig> {
    let mut config = config::load_config(Some(workspace), config_path, None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    config.scheduler.state_dir = Some(config.scheduler.resolve_state_dir(workspace));
    Ok(config)
}

fn build_manager(config: &ConduitConfig, workspace: &Path) -> anyhow::Result<PipelineManager> {
    let pipelines = config
        .all_pipelines(workspace)
        .context("Failed to load pipelines file")?;
    let factory = SpecPipelineFactory::new(workspace);
    Ok(PipelineManager::init(
        config.scheduler.clone(),
        pipelines,
        &factory,
    ))
}

async fn handle_run(
    id: &str,
    overrides: RunOverrides,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<Outcome> {
    let config = load(workspace, config_path)?;
    let manager = build_manager(&config, workspace)?;
    if let Some(reason) = manager.load_report().rejected.get(id) {
        bail!("Pipeline '{}' was rejected: {}", id, reason);
    }

    let result = manager.run_now(id, overrides).await;
    manager.shutdown().await;
    let result = result?;
    print_result(&result);
    Ok(if result.is_success() {
        Outcome::Success
    } else {
        Outcome::RunFailed
    })
}

fn print_result(result: &ExecutionResult) {
    println!(
        "{} {} in {:.1}s",
        result.pipeline_id,
        result.state,
        result.duration().num_milliseconds() as f64 / 1000.0
    );
    println!(
        "  fetched {}  processed {}  skipped {}  failed {}",
        result.fetched_count, result.processed_count, result.skipped_count, result.failed_count
    );
    if result.truncated {
        println!("  truncated: runtime budget exhausted");
    }
    if let Some(failure) = &result.failure {
        println!("  failure: {}", failure);
    }
    if let Some(score) = result.average_score {
        println!("  average score: {:.3}", score);
    }
    if result.total_retries() > 0 {
        println!("  store retries: {}", result.total_retries());
    }
    for error in result.errors.iter().take(10) {
        println!("  [{}] {}: {}", error.kind, error.item_ref, error.cause);
    }
    if result.errors.len() > 10 {
        println!("  ... and {} more errors", result.errors.len() - 10);
    }
    if !result.warnings.is_empty() {
        println!("  {} warning(s)", result.warnings.len());
    }
}

fn handle_status(
    id: Option<&str>,
    json: bool,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<Outcome> {
    let config = load(workspace, config_path)?;
    let pipelines = config.all_pipelines(workspace)?;
    let state_dir = config.scheduler.resolve_state_dir(workspace);
    let persisted = read_run_state(&state_dir)?;

    let mut rows: Vec<PipelineRunState> = pipelines
        .iter()
        .filter(|p| id.is_none_or(|id| p.id == id))
        .map(|p| {
            persisted
                .get(&p.id)
                .cloned()
                .unwrap_or_else(|| PipelineRunState::idle(p.id.clone()))
        })
        .collect();
    if let Some(id) = id {
        if rows.is_empty() {
            bail!("Pipeline not found: {}", id);
        }
    }
    rows.sort_by(|a, b| a.pipeline_id.cmp(&b.pipeline_id));

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(Outcome::Success);
    }
    if rows.is_empty() {
        println!("No pipelines configured.");
        return Ok(Outcome::Success);
    }
    for state in &rows {
        let finished = state
            .last_run_finished_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<24} {:<10} runs {:<5} last finished {}",
            state.pipeline_id, state.status, state.run_count, finished
        );
        if let Some(result) = &state.last_result {
            println!(
                "{:<24} fetched {} processed {} skipped {} failed {}{}",
                "",
                result.fetched_count,
                result.processed_count,
                result.skipped_count,
                result.failed_count,
                result
                    .failure
                    .as_ref()
                    .map(|f| format!(" ({})", f))
                    .unwrap_or_default()
            );
        }
    }
    Ok(Outcome::Success)
}

fn handle_list(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<Outcome> {
    let config = load(workspace, config_path)?;
    let manager = build_manager(&config, workspace)?;

    let overview = manager.list();
    if overview.is_empty() && manager.load_report().rejected.is_empty() {
        println!("No pipelines configured. Run `conduit config init` to create one.");
        return Ok(Outcome::Success);
    }
    for row in &overview {
        let deps = if row.dependencies.is_empty() {
            String::new()
        } else {
            format!(
                "  after {}",
                row.dependencies.iter().cloned().collect::<Vec<_>>().join(", ")
            )
        };
        println!(
            "{:<24} {:<8} {:<22} {}{}",
            row.id,
            if row.enabled { "enabled" } else { "disabled" },
            row.schedule.to_string(),
            row.state.status,
            deps
        );
    }
    let rejected = &manager.load_report().rejected;
    if !rejected.is_empty() {
        println!();
        println!("Rejected:");
        for (id, reason) in rejected {
            println!("  {:<22} {}", id, reason);
        }
    }
    Ok(Outcome::Success)
}

async fn handle_scheduler(
    action: SchedulerAction,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<Outcome> {
    match action {
        SchedulerAction::Start {
            tick_secs,
            max_concurrent,
        } => {
            let mut config = load(workspace, config_path)?;
            if let Some(secs) = tick_secs {
                config.scheduler.tick_interval_secs = secs;
            }
            if let Some(n) = max_concurrent {
                config.scheduler.max_concurrent = n;
            }
            let manager = build_manager(&config, workspace)?;
            for (id, reason) in &manager.load_report().rejected {
                warn!(pipeline_id = %id, reason = %reason, "Skipping rejected pipeline");
            }

            let scheduler = manager.clone();
            let handle = tokio::spawn(async move { scheduler.run_scheduler().await });
            println!(
                "Scheduler running with {} pipeline(s), tick every {}s. Press Ctrl-C to stop.",
                manager.load_report().accepted.len(),
                config.scheduler.tick_interval().as_secs()
            );

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            println!("Stopping scheduler...");
            manager.shutdown().await;
            let _ = handle.await;
            Ok(Outcome::Success)
        }
    }
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<Outcome> {
    match action {
        ConfigAction::Init => {
            let config_path = config::workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(Outcome::Success);
            }
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let toml_str = toml::to_string_pretty(&ConduitConfig::sample())?;
            std::fs::write(&config_path, &toml_str)?;
            info!(path = %config_path.display(), "Wrote starter configuration");
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(Outcome::Success)
        }
        ConfigAction::Show => {
            let config = config::load_config(Some(workspace), config_path, None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(Outcome::Success)
        }
    }
}
