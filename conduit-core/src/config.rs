//! Configuration system for Conduit.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config -> environment variables -> explicit overrides.
//! Pipelines can be declared inline or in a separate YAML/TOML pipelines file.

use crate::error::ConfigError;
use crate::pipeline::{ProcessorSpec, SinkSpec};
use crate::source::SourceSpec;
use crate::validation::{ValidationMode, ValidatorSpec};
use chrono::NaiveTime;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-workspace configuration directory.
pub const WORKSPACE_DIR: &str = ".conduit";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConduitConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Pipelines declared inline.
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
    /// Optional YAML or TOML file contributing more pipelines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipelines_file: Option<PathBuf>,
}

/// Settings for the manager's polling loop and worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Maximum number of pipeline runs executing at once (1 = sequential).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Extra time past `max_runtime_secs` before a run is forcibly failed.
    #[serde(default = "default_hard_timeout_grace_secs")]
    pub hard_timeout_grace_secs: u64,
    /// Directory holding persisted run state. Relative paths resolve against the workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    /// Number of recent execution results kept in memory.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_max_concurrent() -> usize {
    1
}

fn default_hard_timeout_grace_secs() -> u64 {
    60
}

fn default_history_limit() -> usize {
    50
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            max_concurrent: default_max_concurrent(),
            hard_timeout_grace_secs: default_hard_timeout_grace_secs(),
            state_dir: None,
            history_limit: default_history_limit(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn hard_timeout_grace(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_grace_secs)
    }

    /// Resolve the state directory against a workspace root.
    pub fn resolve_state_dir(&self, workspace: &Path) -> PathBuf {
        match &self.state_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => workspace.join(dir),
            None => workspace.join(WORKSPACE_DIR).join("state"),
        }
    }
}

/// When a pipeline becomes due.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Only runs when triggered.
    #[default]
    Manual,
    /// Runs when `every_secs` have elapsed since the last finished run.
    Interval { every_secs: u64 },
    /// Runs once per day after the given UTC time ("HH:MM").
    DailyAt { time: String },
}

impl Schedule {
    /// Parse the `daily_at` time of day.
    pub fn daily_time(&self) -> Option<Result<NaiveTime, ConfigError>> {
        match self {
            Schedule::DailyAt { time } => Some(parse_time_of_day(time)),
            _ => None,
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Manual => write!(f, "manual"),
            Schedule::Interval { every_secs } => write!(f, "every {every_secs}s"),
            Schedule::DailyAt { time } => write!(f, "daily at {time} UTC"),
        }
    }
}

/// Parse an "HH:MM" time of day.
pub fn parse_time_of_day(time: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(time, "%H:%M").map_err(|e| ConfigError::Invalid {
        message: format!("invalid time of day '{time}': {e}"),
    })
}

/// Declarative definition of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_runtime_secs")]
    pub max_runtime_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Ids of pipelines that must have succeeded before this one runs.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    pub parameters: PipelineParameters,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    100
}

fn default_max_runtime_secs() -> u64 {
    3600
}

fn default_max_retries() -> u32 {
    3
}

impl PipelineConfig {
    /// A manual, enabled pipeline with default limits.
    pub fn new(id: impl Into<String>, source: SourceSpec) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            schedule: Schedule::Manual,
            batch_size: default_batch_size(),
            max_runtime_secs: default_max_runtime_secs(),
            max_retries: default_max_retries(),
            dependencies: BTreeSet::new(),
            parameters: PipelineParameters::new(source),
        }
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }

    /// Check the fields that can be validated without looking at other pipelines.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "pipeline id must not be empty".into(),
            });
        }
        let invalid = |message: String| ConfigError::Build {
            id: self.id.clone(),
            message,
        };
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be at least 1".into()));
        }
        if self.parameters.concurrency == 0 {
            return Err(invalid("concurrency must be at least 1".into()));
        }
        if let Schedule::Interval { every_secs: 0 } = self.schedule {
            return Err(invalid("interval schedule needs every_secs > 0".into()));
        }
        if let Some(Err(e)) = self.schedule.daily_time() {
            return Err(invalid(e.to_string()));
        }
        if self.parameters.max_items == Some(0) {
            return Err(invalid("max_items must be at least 1 when set".into()));
        }
        Ok(())
    }
}

/// Pipeline-specific parameters: which source, validators, and hooks to use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineParameters {
    pub source: SourceSpec,
    #[serde(default)]
    pub validators: Vec<ValidatorSpec>,
    #[serde(default)]
    pub validation_mode: ValidationMode,
    #[serde(default)]
    pub processor: ProcessorSpec,
    #[serde(default)]
    pub sink: SinkSpec,
    /// Upper bound on items fetched per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
    /// Items processed and stored concurrently within a batch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Resume from the persisted cursor instead of the source start.
    #[serde(default)]
    pub incremental: bool,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Outbound fetch/store calls allowed per minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<usize>,
}

fn default_concurrency() -> usize {
    4
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

impl PipelineParameters {
    pub fn new(source: SourceSpec) -> Self {
        Self {
            source,
            validators: Vec::new(),
            validation_mode: ValidationMode::default(),
            processor: ProcessorSpec::default(),
            sink: SinkSpec::default(),
            max_items: None,
            concurrency: default_concurrency(),
            incremental: false,
            retry_base_delay_ms: default_retry_base_delay_ms(),
            rate_limit_per_minute: None,
        }
    }
}

impl ConduitConfig {
    /// A starter configuration written by `conduit config init`.
    pub fn sample() -> Self {
        let mut sample = PipelineConfig::new(
            "example",
            SourceSpec::File {
                path: PathBuf::from("data/items.jsonl"),
                format: Default::default(),
                id_field: Some("id".into()),
            },
        );
        sample.enabled = false;
        sample.schedule = Schedule::Interval { every_secs: 3600 };
        sample.parameters.validators = vec![ValidatorSpec::Completeness {
            required: vec!["id".into()],
            recommended: Vec::new(),
            patterns: Default::default(),
        }];
        sample.parameters.sink = SinkSpec::Jsonl {
            path: PathBuf::from("out/example.jsonl"),
        };
        Self {
            scheduler: SchedulerConfig::default(),
            pipelines: vec![sample],
            pipelines_file: None,
        }
    }

    /// All pipelines: inline ones followed by those from `pipelines_file`.
    ///
    /// A relative `pipelines_file` resolves against `base_dir`.
    pub fn all_pipelines(&self, base_dir: &Path) -> Result<Vec<PipelineConfig>, ConfigError> {
        let mut pipelines = self.pipelines.clone();
        if let Some(file) = &self.pipelines_file {
            let path = if file.is_absolute() {
                file.clone()
            } else {
                base_dir.join(file)
            };
            pipelines.extend(load_pipelines_file(&path)?);
        }
        Ok(pipelines)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PipelinesDocument {
    List(Vec<PipelineConfig>),
    Table { pipelines: Vec<PipelineConfig> },
}

impl PipelinesDocument {
    fn into_pipelines(self) -> Vec<PipelineConfig> {
        match self {
            PipelinesDocument::List(list) => list,
            PipelinesDocument::Table { pipelines } => pipelines,
        }
    }
}

/// Load pipeline definitions from a YAML (`.yaml`/`.yml`) or TOML file.
///
/// YAML files may hold a bare list or a `pipelines:` key; TOML files use `[[pipelines]]`.
pub fn load_pipelines_file(path: &Path) -> Result<Vec<PipelineConfig>, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
        message: format!("failed to read {}: {e}", path.display()),
    })?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let doc: PipelinesDocument = if is_yaml {
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError {
            message: format!("{}: {e}", path.display()),
        })?
    } else {
        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            message: format!("{}: {e}", path.display()),
        })?
    };
    Ok(doc.into_pipelines())
}

/// Location of the user-level configuration file, if a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "conduit", "conduit")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Location of the workspace-level configuration file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(WORKSPACE_DIR).join("config.toml")
}

/// Load configuration by merging all layers.
///
/// Order: defaults, `~/.config/conduit/config.toml`, `<workspace>/.conduit/config.toml`,
/// an explicit config file, `CONDUIT_*` environment variables, then scheduler overrides.
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
    overrides: Option<&SchedulerConfig>,
) -> Result<ConduitConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(ConduitConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        figment = figment.merge(Toml::file(path));
    }

    // CONDUIT_SCHEDULER__MAX_CONCURRENT, CONDUIT_PIPELINES_FILE, ...
    figment = figment.merge(Env::prefixed("CONDUIT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::default("scheduler", overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Check whether any Conduit configuration file exists (user-level or workspace-level).
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| workspace_config_path(ws).exists())
}
