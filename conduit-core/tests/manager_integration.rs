//! Manager behavior: dependency gating, triggers, slots, persistence, timeouts.

mod common;

use chrono::Utc;
use common::{BrokenSource, MemorySource, ScriptedStore, SlowProcessor};
use conduit_core::error::SourceError;
use conduit_core::pipeline::PassthroughProcessor;
use conduit_core::source::FileFormat;
use conduit_core::{
    CompositeValidator, ConfigError, Cursor, ItemProcessor, Pipeline, PipelineConfig,
    PipelineError, PipelineManager, PipelineSettings, PipelineState, RunOverrides, RunStatus,
    Schedule, SchedulerConfig, SourceSpec,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Builds in-memory pipelines; the id prefix picks the behavior.
fn memory_factory(config: &PipelineConfig) -> Result<Pipeline, ConfigError> {
    let mut settings = PipelineSettings::from_config(config);
    settings.retry_base_delay = Duration::from_millis(1);
    let processor: Arc<dyn ItemProcessor> = if config.id.starts_with("slow") {
        Arc::new(SlowProcessor {
            delay: Duration::from_secs(1000),
        })
    } else {
        Arc::new(PassthroughProcessor::new(None))
    };
    let source: Arc<dyn conduit_core::DataSource> = if config.id.starts_with("fail") {
        Arc::new(BrokenSource(SourceError::Auth {
            source_id: "broken".into(),
            message: "HTTP 403".into(),
        }))
    } else {
        Arc::new(MemorySource::numbered(4))
    };
    Ok(Pipeline::new(
        config.id.clone(),
        source,
        CompositeValidator::empty(),
        processor,
        Arc::new(ScriptedStore::new()),
        settings,
    ))
}

fn pipeline(id: &str) -> PipelineConfig {
    PipelineConfig::new(
        id,
        SourceSpec::File {
            path: format!("{id}.jsonl").into(),
            format: FileFormat::default(),
            id_field: None,
        },
    )
}

fn scheduler() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent: 4,
        ..SchedulerConfig::default()
    }
}

fn every_minute(config: PipelineConfig) -> PipelineConfig {
    config.with_schedule(Schedule::Interval { every_secs: 60 })
}

#[tokio::test]
async fn test_dependent_waits_for_upstream_success() {
    let manager = PipelineManager::init(
        scheduler(),
        vec![pipeline("a"), every_minute(pipeline("b")).with_dependencies(["a"])],
        &memory_factory,
    );
    assert!(manager.load_report().is_clean());
    assert_eq!(manager.load_report().accepted, vec!["a", "b"]);

    // b is due by schedule but a has never run.
    assert!(manager.tick_at(Utc::now()).is_empty());
    assert_eq!(manager.status("b").unwrap().status, RunStatus::Idle);

    let a = manager.run_now("a", RunOverrides::default()).await.unwrap();
    assert!(a.is_success());
    assert_eq!(manager.status("a").unwrap().status, RunStatus::Succeeded);

    assert_eq!(manager.tick_at(Utc::now()), vec!["b"]);
    manager.wait_idle().await;
    let b = manager.status("b").unwrap();
    assert_eq!(b.status, RunStatus::Succeeded);
    assert_eq!(b.run_count, 1);

    // b already consumed a's latest success.
    manager.trigger("b").unwrap();
    assert!(manager.tick_at(Utc::now()).is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_upstream_keeps_dependent_blocked() {
    let manager = PipelineManager::init(
        scheduler(),
        vec![pipeline("fail-a"), every_minute(pipeline("b")).with_dependencies(["fail-a"])],
        &memory_factory,
    );
    let result = manager.run_now("fail-a", RunOverrides::default()).await.unwrap();
    assert_eq!(result.state, PipelineState::Failed);
    assert_eq!(manager.status("fail-a").unwrap().status, RunStatus::Failed);
    assert!(manager.tick_at(Utc::now()).is_empty());
    assert_eq!(manager.status("b").unwrap().status, RunStatus::Idle);
}

#[tokio::test]
async fn test_cycle_rejected_others_load() {
    let manager = PipelineManager::init(
        scheduler(),
        vec![
            pipeline("a").with_dependencies(["b"]),
            pipeline("b").with_dependencies(["a"]),
            pipeline("c"),
            pipeline("d").with_dependencies(["a"]),
        ],
        &memory_factory,
    );
    let report = manager.load_report();
    assert_eq!(report.accepted, vec!["c"]);
    assert!(matches!(report.rejected["a"], ConfigError::DependencyCycle { .. }));
    assert!(matches!(report.rejected["b"], ConfigError::DependencyCycle { .. }));
    assert!(matches!(
        report.rejected["d"],
        ConfigError::ExcludedDependency { .. }
    ));

    assert!(matches!(
        manager.run_now("a", RunOverrides::default()).await,
        Err(PipelineError::NotFound { .. })
    ));
    assert!(manager.run_now("c", RunOverrides::default()).await.unwrap().is_success());
}

#[tokio::test]
async fn test_factory_failure_excludes_dependents() {
    let factory = |config: &PipelineConfig| -> Result<Pipeline, ConfigError> {
        if config.id == "bad" {
            return Err(ConfigError::Build {
                id: config.id.clone(),
                message: "no such table".into(),
            });
        }
        memory_factory(config)
    };
    let manager = PipelineManager::init(
        scheduler(),
        vec![pipeline("bad"), pipeline("after").with_dependencies(["bad"]), pipeline("ok")],
        &factory,
    );
    let report = manager.load_report();
    assert_eq!(report.accepted, vec!["ok"]);
    assert!(matches!(report.rejected["bad"], ConfigError::Build { .. }));
    assert!(matches!(
        report.rejected["after"],
        ConfigError::ExcludedDependency { .. }
    ));
}

#[tokio::test]
async fn test_trigger_runs_manual_pipeline_once() {
    let mut disabled = pipeline("off");
    disabled.enabled = false;
    let manager = PipelineManager::init(scheduler(), vec![pipeline("a"), disabled], &memory_factory);

    assert!(manager.due_at(Utc::now()).is_empty());
    manager.trigger("a").unwrap();
    assert!(manager.list().iter().any(|row| row.id == "a" && row.triggered));
    assert_eq!(manager.due_at(Utc::now()), vec!["a"]);

    assert_eq!(manager.tick_at(Utc::now()), vec!["a"]);
    manager.wait_idle().await;
    assert_eq!(manager.status("a").unwrap().status, RunStatus::Succeeded);
    assert!(manager.due_at(Utc::now()).is_empty());

    assert!(matches!(
        manager.trigger("off"),
        Err(PipelineError::Disabled { .. })
    ));
    assert!(matches!(
        manager.run_now("off", RunOverrides::default()).await,
        Err(PipelineError::Disabled { .. })
    ));
    assert!(matches!(
        manager.trigger("missing"),
        Err(PipelineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_run_now_dependency_check_and_override() {
    let manager = PipelineManager::init(
        scheduler(),
        vec![pipeline("a"), pipeline("b").with_dependencies(["a"])],
        &memory_factory,
    );
    match manager.run_now("b", RunOverrides::default()).await {
        Err(PipelineError::DependenciesNotSatisfied { waiting_on, .. }) => {
            assert_eq!(waiting_on, vec!["a"]);
        }
        other => panic!("expected dependency error, got {other:?}"),
    }

    let forced = manager
        .run_now(
            "b",
            RunOverrides {
                ignore_dependencies: true,
                ..RunOverrides::default()
            },
        )
        .await
        .unwrap();
    assert!(forced.is_success());
    assert_eq!(forced.processed_count, 4);
}

#[tokio::test]
async fn test_max_concurrent_limits_tick() {
    let manager = PipelineManager::init(
        SchedulerConfig {
            max_concurrent: 1,
            ..SchedulerConfig::default()
        },
        vec![every_minute(pipeline("a")), every_minute(pipeline("b"))],
        &memory_factory,
    );
    let first = manager.tick_at(Utc::now());
    assert_eq!(first.len(), 1);
    manager.wait_idle().await;

    let second = manager.tick_at(Utc::now());
    assert_eq!(second.len(), 1);
    assert_ne!(first, second);
    manager.wait_idle().await;

    // Both ran within the interval; nothing is due.
    assert!(manager.tick_at(Utc::now()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_already_running_and_hard_timeout() {
    let mut slow = pipeline("slow");
    slow.max_runtime_secs = 1;
    let manager = PipelineManager::init(
        SchedulerConfig {
            hard_timeout_grace_secs: 1,
            ..scheduler()
        },
        vec![slow],
        &memory_factory,
    );
    manager.trigger("slow").unwrap();
    assert_eq!(manager.tick_at(Utc::now()), vec!["slow"]);
    assert_eq!(manager.status("slow").unwrap().status, RunStatus::Running);
    assert!(matches!(
        manager.run_now("slow", RunOverrides::default()).await,
        Err(PipelineError::AlreadyRunning { .. })
    ));

    manager.wait_idle().await;
    let state = manager.status("slow").unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    let result = state.last_result.unwrap();
    assert_eq!(result.failure.as_deref(), Some("timeout"));
    assert_eq!(
        manager.pipeline("slow").unwrap().state(),
        PipelineState::Failed
    );
    assert_eq!(manager.history(Some("slow")).len(), 1);
}

#[tokio::test]
async fn test_run_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = SchedulerConfig {
        state_dir: Some(dir.path().to_path_buf()),
        ..scheduler()
    };

    let manager = PipelineManager::init(config.clone(), vec![pipeline("a")], &memory_factory);
    manager.run_now("a", RunOverrides::default()).await.unwrap();
    manager.shutdown().await;
    assert!(manager.is_shut_down());
    assert!(matches!(
        manager.run_now("a", RunOverrides::default()).await,
        Err(PipelineError::ShutDown)
    ));

    let restarted = PipelineManager::init(
        config,
        vec![pipeline("a"), pipeline("b").with_dependencies(["a"])],
        &memory_factory,
    );
    let a = restarted.status("a").unwrap();
    assert_eq!(a.status, RunStatus::Succeeded);
    assert_eq!(a.run_count, 1);
    // a's persisted success satisfies b.
    assert!(restarted.run_now("b", RunOverrides::default()).await.unwrap().is_success());
}

#[tokio::test]
async fn test_incremental_runs_resume_from_cursor() {
    let mut config = pipeline("inc");
    config.parameters.incremental = true;
    let manager = PipelineManager::init(scheduler(), vec![config], &memory_factory);
    let limited = RunOverrides {
        max_items: Some(3),
        ..RunOverrides::default()
    };

    let first = manager.run_now("inc", limited.clone()).await.unwrap();
    assert_eq!(first.processed_count, 3);
    assert_eq!(manager.status("inc").unwrap().cursor, Cursor::from_offset(3));

    let second = manager.run_now("inc", limited).await.unwrap();
    assert_eq!(second.processed_count, 1);
    assert_eq!(second.next_cursor, Cursor::from_offset(4));
    assert_eq!(manager.history(None).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_loop_runs_chain_and_stops_on_shutdown() {
    let manager = PipelineManager::init(
        SchedulerConfig {
            tick_interval_secs: 1,
            ..scheduler()
        },
        vec![
            every_minute(pipeline("a")),
            every_minute(pipeline("b")).with_dependencies(["a"]),
        ],
        &memory_factory,
    );
    let looping = tokio::spawn({
        let manager = manager.clone();
        async move { manager.run_scheduler().await }
    });

    // The first tick starts a; b only becomes due on a later tick.
    let settled = tokio::time::timeout(Duration::from_secs(30), async {
        while manager.status("b").unwrap().status != RunStatus::Succeeded {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await;
    assert!(settled.is_ok(), "scheduler never ran the dependent");

    let a = manager.status("a").unwrap();
    let b = manager.status("b").unwrap();
    assert_eq!(a.status, RunStatus::Succeeded);
    assert_eq!(a.run_count, 1);
    assert_eq!(b.run_count, 1);
    assert!(b.last_run_started_at.unwrap() >= a.last_run_finished_at.unwrap());

    manager.shutdown().await;
    let stopped = tokio::time::timeout(Duration::from_secs(5), looping).await;
    assert!(matches!(stopped, Ok(Ok(()))));
    assert_eq!(manager.history(None).len(), 2);
}
