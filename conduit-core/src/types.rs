//! Core data types shared across sources, validators, pipelines, and the manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// An opaque unit of work produced by a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    /// Stable reference used in errors, warnings, and retry accounting.
    pub item_ref: String,
    pub payload: Value,
    /// Set when the source record could not be parsed. The raw text is kept in `payload`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl RawItem {
    pub fn new(item_ref: impl Into<String>, payload: Value) -> Self {
        Self {
            item_ref: item_ref.into(),
            payload,
            parse_error: None,
        }
    }

    /// A record the source could not parse. It still flows to validation so it is counted.
    pub fn malformed(
        item_ref: impl Into<String>,
        raw: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            item_ref: item_ref.into(),
            payload: Value::String(raw.into()),
            parse_error: Some(error.into()),
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.parse_error.is_some()
    }
}

/// Restartable position within a data source.
///
/// Sources interpret the string themselves (record offset, last row id, ...).
/// The empty cursor always means "from the beginning".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn start() -> Self {
        Self(String::new())
    }

    pub fn new(position: impl Into<String>) -> Self {
        Self(position.into())
    }

    pub fn from_offset(offset: u64) -> Self {
        Self(offset.to_string())
    }

    pub fn is_start(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interpret the cursor as a numeric offset. The start cursor is offset zero.
    pub fn as_offset(&self) -> Option<u64> {
        if self.is_start() {
            Some(0)
        } else {
            self.0.parse().ok()
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_start() {
            write!(f, "<start>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// One page returned by `DataSource::fetch_batch`.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPage {
    pub items: Vec<RawItem>,
    pub next_cursor: Cursor,
    pub has_more: bool,
}

impl FetchPage {
    /// An exhausted page that leaves the cursor where it was.
    pub fn empty(cursor: Cursor) -> Self {
        Self {
            items: Vec::new(),
            next_cursor: cursor,
            has_more: false,
        }
    }
}

/// Output of the process hook, consumed once by the store hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub item_ref: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ProcessedRecord {
    pub fn new(item_ref: impl Into<String>, data: Value) -> Self {
        Self {
            item_ref: item_ref.into(),
            data,
            annotations: None,
            warnings: Vec::new(),
        }
    }
}

/// Where in the item lifecycle a per-item error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    Validation,
    Process,
    Store,
}

impl fmt::Display for ItemErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemErrorKind::Validation => write!(f, "validation"),
            ItemErrorKind::Process => write!(f, "process"),
            ItemErrorKind::Store => write!(f, "store"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub item_ref: String,
    pub kind: ItemErrorKind,
    pub cause: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemWarning {
    pub item_ref: String,
    pub message: String,
}

/// Lifecycle phase of a single pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Created,
    Fetching,
    Validating,
    Processing,
    Storing,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }

    /// Legal edges of the run state machine.
    ///
    /// `Storing -> Fetching` starts the next batch. A run may complete from
    /// `Created` or `Fetching` when the source has nothing (more) to give.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Created, Fetching)
            | (Fetching, Validating)
            | (Validating, Processing)
            | (Processing, Storing)
            | (Storing, Fetching)
            | (Created, Completed)
            | (Fetching, Completed)
            | (Storing, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Created => write!(f, "created"),
            PipelineState::Fetching => write!(f, "fetching"),
            PipelineState::Validating => write!(f, "validating"),
            PipelineState::Processing => write!(f, "processing"),
            PipelineState::Storing => write!(f, "storing"),
            PipelineState::Completed => write!(f, "completed"),
            PipelineState::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub pipeline_id: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: PipelineState,
    pub fetched_count: usize,
    pub processed_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default)]
    pub errors: Vec<ItemError>,
    #[serde(default)]
    pub warnings: Vec<ItemWarning>,
    #[serde(default)]
    pub item_retries: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_score: Option<f64>,
    #[serde(default)]
    pub next_cursor: Cursor,
}

impl ExecutionResult {
    /// A fresh result for a run that has just started.
    pub fn begin(pipeline_id: impl Into<String>, start_cursor: Cursor) -> Self {
        let now = Utc::now();
        Self {
            pipeline_id: pipeline_id.into(),
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            state: PipelineState::Created,
            fetched_count: 0,
            processed_count: 0,
            skipped_count: 0,
            failed_count: 0,
            truncated: false,
            cancelled: false,
            failure: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            item_retries: BTreeMap::new(),
            average_score: None,
            next_cursor: start_cursor,
        }
    }

    /// A failed result for a run that never produced its own (e.g. killed by a hard timeout).
    pub fn aborted(
        pipeline_id: impl Into<String>,
        started_at: DateTime<Utc>,
        start_cursor: Cursor,
        cause: impl Into<String>,
    ) -> Self {
        let mut result = Self::begin(pipeline_id, start_cursor);
        result.started_at = started_at;
        result.state = PipelineState::Failed;
        result.failure = Some(cause.into());
        result
    }

    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Completed
    }

    pub fn total_retries(&self) -> u32 {
        self.item_retries.values().sum()
    }

    /// Every dequeued item is accounted for exactly once.
    pub fn is_conserved(&self) -> bool {
        self.fetched_count == self.processed_count + self.skipped_count + self.failed_count
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Scheduler-facing status of a pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "idle"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-pipeline run state, owned by the pipeline manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunState {
    pub pipeline_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<ExecutionResult>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub cursor: Cursor,
}

impl PipelineRunState {
    pub fn idle(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            status: RunStatus::Idle,
            last_run_started_at: None,
            last_run_finished_at: None,
            last_result: None,
            run_count: 0,
            cursor: Cursor::start(),
        }
    }

    pub fn has_run(&self) -> bool {
        self.last_run_finished_at.is_some()
    }

    /// Mark the start of a run.
    pub fn begin_run(&mut self, at: DateTime<Utc>) {
        self.status = RunStatus::Running;
        self.last_run_started_at = Some(at);
    }

    /// Record a terminal result.
    ///
    /// Failed runs keep the cursor committed by their last completed batch.
    pub fn finish_run(&mut self, result: ExecutionResult) {
        self.status = if result.is_success() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        self.last_run_finished_at = Some(result.finished_at);
        self.run_count += 1;
        if result.is_success() {
            self.cursor = result.next_cursor.clone();
        }
        self.last_result = Some(result);
    }
}
