//! Pipeline manager: registry, dependency-aware polling scheduler, and run state.
//!
//! The manager owns every [`PipelineRunState`]. Runs are started either by the
//! scheduler tick (schedule or pending trigger, gated on dependencies) or
//! directly through [`PipelineManager::run_now`]. At most one run per pipeline
//! is in flight at any time.

pub mod factory;
pub mod graph;
pub mod schedule;
pub mod state;

pub use factory::{PipelineFactory, SpecPipelineFactory};
pub use graph::Resolution;
pub use state::{RunStateStore, read_run_state};

use crate::config::{PipelineConfig, Schedule, SchedulerConfig};
use crate::error::{ConfigError, PipelineError};
use crate::pipeline::{Checkpoint, Pipeline, RunOptions};
use crate::types::{Cursor, ExecutionResult, PipelineRunState, RunStatus};
use crate::validation::ValidationMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Per-invocation overrides for [`PipelineManager::run_now`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOverrides {
    pub batch_size: Option<usize>,
    pub max_items: Option<usize>,
    pub validation_mode: Option<ValidationMode>,
    pub ignore_dependencies: bool,
}

/// What `init` accepted and rejected.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Accepted pipeline ids, dependencies first.
    pub accepted: Vec<String>,
    pub rejected: BTreeMap<String, ConfigError>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// One row of [`PipelineManager::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOverview {
    pub id: String,
    pub enabled: bool,
    pub schedule: Schedule,
    pub dependencies: BTreeSet<String>,
    pub triggered: bool,
    pub state: PipelineRunState,
}

struct Entry {
    config: PipelineConfig,
    pipeline: Arc<Pipeline>,
}

struct Inner {
    scheduler: SchedulerConfig,
    entries: BTreeMap<String, Entry>,
    report: LoadReport,
    states: Mutex<BTreeMap<String, PipelineRunState>>,
    triggers: Mutex<BTreeSet<String>>,
    history: Mutex<VecDeque<ExecutionResult>>,
    store: Option<RunStateStore>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn entry(&self, id: &str) -> Result<&Entry, PipelineError> {
        self.entries
            .get(id)
            .ok_or_else(|| PipelineError::NotFound { id: id.to_string() })
    }

    fn persist(&self, states: &BTreeMap<String, PipelineRunState>) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(states) {
                warn!(error = %e, "Failed to persist run state");
            }
        }
    }

    fn start_cursor(&self, entry: &Entry, state: &PipelineRunState) -> Cursor {
        if entry.pipeline.settings().incremental {
            state.cursor.clone()
        } else {
            Cursor::start()
        }
    }
}

/// Registry and scheduler for a set of pipelines. Cheap to clone.
#[derive(Clone)]
pub struct PipelineManager {
    inner: Arc<Inner>,
}

impl PipelineManager {
    /// Validate `configs`, resolve dependencies, and build every accepted pipeline.
    ///
    /// Offending pipelines are rejected individually; the rest load. Persisted run
    /// state is restored from `scheduler.state_dir` when set.
    pub fn init(
        scheduler: SchedulerConfig,
        configs: Vec<PipelineConfig>,
        factory: &dyn PipelineFactory,
    ) -> Self {
        let mut rejected = BTreeMap::new();
        let configs = graph::reject_duplicates(configs, &mut rejected);
        let configs: Vec<PipelineConfig> = configs
            .into_iter()
            .filter(|config| match config.validate() {
                Ok(()) => true,
                Err(e) => {
                    rejected.insert(config.id.clone(), e);
                    false
                }
            })
            .collect();

        let resolution = graph::resolve(&configs, rejected);
        let mut rejected = resolution.rejected;
        let mut by_id: BTreeMap<String, PipelineConfig> =
            configs.into_iter().map(|c| (c.id.clone(), c)).collect();

        let mut entries = BTreeMap::new();
        let mut accepted = Vec::new();
        for id in resolution.order {
            let Some(config) = by_id.remove(&id) else {
                continue;
            };
            // Order is topological, so a failed build upstream is already recorded.
            if let Some(dep) = config.dependencies.iter().find(|d| rejected.contains_key(*d)) {
                rejected.insert(
                    id.clone(),
                    ConfigError::ExcludedDependency {
                        id: id.clone(),
                        dependency: dep.clone(),
                    },
                );
                continue;
            }
            match factory.build(&config) {
                Ok(pipeline) => {
                    accepted.push(id.clone());
                    entries.insert(
                        id,
                        Entry {
                            config,
                            pipeline: Arc::new(pipeline),
                        },
                    );
                }
                Err(e) => {
                    rejected.insert(id, e);
                }
            }
        }

        for (id, error) in &rejected {
            warn!(pipeline_id = %id, error = %error, "Pipeline rejected");
        }

        let store = scheduler.state_dir.as_ref().map(RunStateStore::new);
        let mut states = store
            .as_ref()
            .map(RunStateStore::load_or_default)
            .unwrap_or_default();
        for id in entries.keys() {
            states
                .entry(id.clone())
                .or_insert_with(|| PipelineRunState::idle(id.clone()));
        }

        info!(
            accepted = accepted.len(),
            rejected = rejected.len(),
            max_concurrent = scheduler.max_concurrent,
            "Pipeline manager initialized"
        );

        let permits = Arc::new(Semaphore::new(scheduler.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                scheduler,
                entries,
                report: LoadReport { accepted, rejected },
                states: Mutex::new(states),
                triggers: Mutex::new(BTreeSet::new()),
                history: Mutex::new(VecDeque::new()),
                store,
                permits,
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn load_report(&self) -> &LoadReport {
        &self.inner.report
    }

    /// The runnable pipeline, e.g. to observe its phase.
    pub fn pipeline(&self, id: &str) -> Option<Arc<Pipeline>> {
        self.inner.entries.get(id).map(|e| Arc::clone(&e.pipeline))
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Ids of accepted pipelines that are due at `now`, dependencies first.
    pub fn due_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let states = lock(&self.inner.states);
        let triggers = lock(&self.inner.triggers);
        self.due_locked(now, &states, &triggers)
    }

    fn due_locked(
        &self,
        now: DateTime<Utc>,
        states: &BTreeMap<String, PipelineRunState>,
        triggers: &BTreeSet<String>,
    ) -> Vec<String> {
        self.inner
            .report
            .accepted
            .iter()
            .filter(|id| {
                let Some(entry) = self.inner.entries.get(*id) else {
                    return false;
                };
                let Some(state) = states.get(*id) else {
                    return false;
                };
                entry.config.enabled
                    && state.status != RunStatus::Running
                    && (triggers.contains(*id)
                        || schedule::schedule_due(&entry.config.schedule, state, now))
                    && schedule::blocking_dependencies(&entry.config.dependencies, state, states)
                        .is_empty()
            })
            .cloned()
            .collect()
    }

    /// One scheduler tick: start every due pipeline a run slot is free for.
    ///
    /// Returns the ids started. Pipelines left waiting for a slot stay due.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Vec<String> {
        if self.is_shut_down() {
            return Vec::new();
        }
        let mut started = Vec::new();
        let mut states = lock(&self.inner.states);
        let mut triggers = lock(&self.inner.triggers);

        for id in self.due_locked(now, &states, &triggers) {
            // Started runs change dependency status, so re-check gating per id.
            let Some(entry) = self.inner.entries.get(&id) else {
                continue;
            };
            let Some(own) = states.get(&id) else {
                continue;
            };
            if !schedule::blocking_dependencies(&entry.config.dependencies, own, &states).is_empty()
            {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.inner.permits).try_acquire_owned() else {
                debug!(pipeline_id = %id, "No free run slot; deferring");
                break;
            };
            let Some(state) = states.get_mut(&id) else {
                continue;
            };
            let cursor = self.inner.start_cursor(entry, state);
            state.begin_run(now);
            triggers.remove(&id);

            let inner = Arc::clone(&self.inner);
            let run_id = id.clone();
            self.inner.tracker.spawn(async move {
                execute_run(inner, run_id, RunOptions::from_cursor(cursor), Some(permit)).await;
            });
            started.push(id);
        }

        if !started.is_empty() {
            self.inner.persist(&states);
            info!(started = ?started, "Scheduler tick started pipelines");
        }
        started
    }

    /// Poll on the configured tick until [`shutdown`](Self::shutdown) is called.
    pub async fn run_scheduler(&self) {
        let mut interval = tokio::time::interval(self.inner.scheduler.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            tick_secs = self.inner.scheduler.tick_interval().as_secs(),
            pipelines = self.inner.entries.len(),
            "Scheduler started"
        );
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick_at(Utc::now());
                }
            }
        }
        info!("Scheduler stopped");
    }

    /// Wait for every run started so far to finish.
    pub async fn wait_idle(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        if !self.is_shut_down() {
            self.inner.tracker.reopen();
        }
    }

    /// Make a pipeline due once, regardless of its schedule. Dependencies still gate it.
    pub fn trigger(&self, id: &str) -> Result<(), PipelineError> {
        if self.is_shut_down() {
            return Err(PipelineError::ShutDown);
        }
        let entry = self.inner.entry(id)?;
        if !entry.config.enabled {
            return Err(PipelineError::Disabled { id: id.to_string() });
        }
        lock(&self.inner.triggers).insert(id.to_string());
        debug!(pipeline_id = %id, "Pipeline triggered");
        Ok(())
    }

    /// Run a pipeline immediately and wait for its result.
    ///
    /// Bypasses the schedule and the run-slot limit, but never runs a pipeline twice
    /// at once. Dependencies must have succeeded unless overridden.
    pub async fn run_now(
        &self,
        id: &str,
        overrides: RunOverrides,
    ) -> Result<ExecutionResult, PipelineError> {
        if self.is_shut_down() {
            return Err(PipelineError::ShutDown);
        }
        let entry = self.inner.entry(id)?;
        if !entry.config.enabled {
            return Err(PipelineError::Disabled { id: id.to_string() });
        }

        let cursor = {
            let mut states = lock(&self.inner.states);
            if !overrides.ignore_dependencies {
                let waiting_on =
                    schedule::unsucceeded_dependencies(&entry.config.dependencies, &states);
                if !waiting_on.is_empty() {
                    return Err(PipelineError::DependenciesNotSatisfied {
                        id: id.to_string(),
                        waiting_on,
                    });
                }
            }
            let state = states
                .entry(id.to_string())
                .or_insert_with(|| PipelineRunState::idle(id));
            if state.status == RunStatus::Running {
                return Err(PipelineError::AlreadyRunning { id: id.to_string() });
            }
            let cursor = self.inner.start_cursor(entry, state);
            state.begin_run(Utc::now());
            lock(&self.inner.triggers).remove(id);
            self.inner.persist(&states);
            cursor
        };

        let options = RunOptions {
            cursor,
            batch_size: overrides.batch_size,
            max_items: overrides.max_items,
            validation_mode: overrides.validation_mode,
            checkpoint: None,
        };
        let run = execute_run(Arc::clone(&self.inner), id.to_string(), options, None);
        Ok(self.inner.tracker.track_future(run).await)
    }

    pub fn status(&self, id: &str) -> Result<PipelineRunState, PipelineError> {
        self.inner.entry(id)?;
        Ok(lock(&self.inner.states)
            .get(id)
            .cloned()
            .unwrap_or_else(|| PipelineRunState::idle(id)))
    }

    pub fn list(&self) -> Vec<PipelineOverview> {
        let states = lock(&self.inner.states);
        let triggers = lock(&self.inner.triggers);
        self.inner
            .entries
            .iter()
            .map(|(id, entry)| PipelineOverview {
                id: id.clone(),
                enabled: entry.config.enabled,
                schedule: entry.config.schedule.clone(),
                dependencies: entry.config.dependencies.clone(),
                triggered: triggers.contains(id),
                state: states
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| PipelineRunState::idle(id.clone())),
            })
            .collect()
    }

    /// Recent results, oldest first, optionally for one pipeline.
    pub fn history(&self, id: Option<&str>) -> Vec<ExecutionResult> {
        lock(&self.inner.history)
            .iter()
            .filter(|r| id.is_none_or(|id| r.pipeline_id == id))
            .cloned()
            .collect()
    }

    /// Cancel in-flight runs, wait for them to finish, and persist final state.
    pub async fn shutdown(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!("Shutting down pipeline manager");
        }
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        let states = lock(&self.inner.states);
        self.inner.persist(&states);
    }
}

/// Run one pipeline under its hard timeout and record the outcome.
async fn execute_run(
    inner: Arc<Inner>,
    id: String,
    mut options: RunOptions,
    permit: Option<OwnedSemaphorePermit>,
) -> ExecutionResult {
    let Some(entry) = inner.entries.get(&id) else {
        return ExecutionResult::aborted(id, Utc::now(), options.cursor, "unknown pipeline");
    };
    let pipeline = Arc::clone(&entry.pipeline);
    let started_at = lock(&inner.states)
        .get(&id)
        .and_then(|s| s.last_run_started_at)
        .unwrap_or_else(Utc::now);

    let committer = Arc::clone(&inner);
    let commit_id = id.clone();
    let checkpoint: Checkpoint = Arc::new(move |cursor: &Cursor| {
        let mut states = lock(&committer.states);
        if let Some(state) = states.get_mut(&commit_id) {
            state.cursor = cursor.clone();
        }
        committer.persist(&states);
    });
    options.checkpoint = Some(checkpoint);

    let hard_limit = pipeline.settings().max_runtime + inner.scheduler.hard_timeout_grace();
    let cancel = inner.cancel.child_token();
    let start_cursor = options.cursor.clone();

    let result = match tokio::time::timeout(hard_limit, pipeline.run(options, cancel)).await {
        Ok(result) => result,
        Err(_) => {
            pipeline.abandon();
            warn!(
                pipeline_id = %id,
                limit_secs = hard_limit.as_secs(),
                "Run exceeded hard timeout"
            );
            let committed = lock(&inner.states)
                .get(&id)
                .map(|s| s.cursor.clone())
                .unwrap_or(start_cursor);
            ExecutionResult::aborted(id.clone(), started_at, committed, "timeout")
        }
    };

    {
        let mut states = lock(&inner.states);
        states
            .entry(id.clone())
            .or_insert_with(|| PipelineRunState::idle(id.clone()))
            .finish_run(result.clone());
        inner.persist(&states);
    }
    {
        let mut history = lock(&inner.history);
        history.push_back(result.clone());
        while history.len() > inner.scheduler.history_limit.max(1) {
            history.pop_front();
        }
    }
    drop(permit);
    result
}
