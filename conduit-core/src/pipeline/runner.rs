//! Pipeline lifecycle: fetch, validate, process, store, one batch at a time.

use super::hooks::{ItemProcessor, ItemStore};
use super::rate_limiter::RateLimiter;
use super::retry::RetryPolicy;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, SourceError, StoreError};
use crate::source::DataSource;
use crate::types::{
    Cursor, ExecutionResult, ItemError, ItemErrorKind, ItemWarning, PipelineState,
    ProcessedRecord, RawItem,
};
use crate::validation::{CompositeValidator, ValidationMode, ValidationResult};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Called with the cursor after every completed batch.
pub type Checkpoint = Arc<dyn Fn(&Cursor) + Send + Sync>;

/// Limits a pipeline runs with unless a run overrides them.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub max_items: Option<usize>,
    pub max_runtime: Duration,
    pub max_retries: u32,
    pub concurrency: usize,
    pub retry_base_delay: Duration,
    pub validation_mode: ValidationMode,
    pub incremental: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_items: None,
            max_runtime: Duration::from_secs(3600),
            max_retries: 3,
            concurrency: 4,
            retry_base_delay: Duration::from_millis(500),
            validation_mode: ValidationMode::Strict,
            incremental: false,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let params = &config.parameters;
        Self {
            batch_size: config.batch_size.max(1),
            max_items: params.max_items,
            max_runtime: config.max_runtime(),
            max_retries: config.max_retries,
            concurrency: params.concurrency.max(1),
            retry_base_delay: Duration::from_millis(params.retry_base_delay_ms),
            validation_mode: params.validation_mode,
            incremental: params.incremental,
        }
    }
}

/// Per-run overrides.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Where to start reading.
    pub cursor: Cursor,
    pub batch_size: Option<usize>,
    pub max_items: Option<usize>,
    pub validation_mode: Option<ValidationMode>,
    pub checkpoint: Option<Checkpoint>,
}

impl RunOptions {
    pub fn from_cursor(cursor: Cursor) -> Self {
        Self {
            cursor,
            ..Self::default()
        }
    }
}

/// Why a run stopped early.
#[derive(Debug, thiserror::Error)]
enum RunAbort {
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    State(#[from] PipelineError),
    #[error("{0}")]
    Preflight(String),
}

/// A batch handed back by `assemble_batch`.
struct Assembled {
    items: Vec<RawItem>,
    /// Position after the last fetched item.
    cursor: Cursor,
    exhausted: bool,
    /// The deadline passed before `want` items were in hand.
    out_of_time: bool,
}

impl Assembled {
    fn new(items: Vec<RawItem>, cursor: Cursor, exhausted: bool, out_of_time: bool) -> Self {
        Self {
            items,
            cursor,
            exhausted,
            out_of_time,
        }
    }
}

/// An item after the process phase.
enum Staged {
    Invalid,
    Skipped,
    ProcessFailed(String),
    Ready(ProcessedRecord),
}

/// An item after the store phase.
enum ItemOutcome {
    Invalid,
    Skipped,
    Failed {
        kind: ItemErrorKind,
        cause: String,
        retries: u32,
    },
    Stored {
        warnings: Vec<String>,
        retries: u32,
    },
}

/// One source, one validator chain, and the hooks that turn valid items into stored records.
///
/// A pipeline may be run many times, but never concurrently; the manager enforces
/// a single writer per pipeline id.
pub struct Pipeline {
    id: String,
    source: Arc<dyn DataSource>,
    validator: Arc<CompositeValidator>,
    processor: Arc<dyn ItemProcessor>,
    store: Arc<dyn ItemStore>,
    settings: PipelineSettings,
    rate_limiter: Option<Arc<RateLimiter>>,
    state: watch::Sender<PipelineState>,
}

impl Pipeline {
    pub fn new(
        id: impl Into<String>,
        source: Arc<dyn DataSource>,
        validator: CompositeValidator,
        processor: Arc<dyn ItemProcessor>,
        store: Arc<dyn ItemStore>,
        settings: PipelineSettings,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Created);
        Self {
            id: id.into(),
            source,
            validator: Arc::new(validator),
            processor,
            store,
            settings,
            rate_limiter: None,
            state,
        }
    }

    /// Gate every fetch and store call through `limiter`.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn source_identifier(&self) -> String {
        self.source.identifier()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Observe phase changes of the current and future runs.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Move to `to` if the state machine allows it.
    pub fn transition(&self, to: PipelineState) -> Result<(), PipelineError> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|current| {
            if current.can_transition_to(to) {
                *current = to;
                true
            } else {
                outcome = Err(PipelineError::InvalidStateTransition {
                    from: current.to_string(),
                    to: to.to_string(),
                });
                false
            }
        });
        outcome
    }

    /// Force a non-terminal pipeline into `Failed`, e.g. after its run was dropped.
    pub(crate) fn abandon(&self) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = PipelineState::Failed;
                true
            }
        });
    }

    /// Execute one run. Always returns a result; failures are reported inside it.
    pub async fn run(&self, options: RunOptions, cancel: CancellationToken) -> ExecutionResult {
        let mut result = ExecutionResult::begin(&self.id, options.cursor.clone());
        self.state.send_replace(PipelineState::Created);

        let span = info_span!("pipeline_run", pipeline_id = %self.id, run_id = %result.run_id);
        let outcome = self
            .execute(&options, &cancel, &mut result)
            .instrument(span.clone())
            .await;

        let _enter = span.enter();
        match outcome {
            Ok(()) => {
                if let Err(e) = self.transition(PipelineState::Completed) {
                    result.failure = Some(e.to_string());
                    self.abandon();
                }
            }
            Err(abort) => {
                result.failure = Some(abort.to_string());
                self.abandon();
            }
        }
        result.state = self.state();
        result.finished_at = Utc::now();

        if result.is_success() {
            info!(
                fetched = result.fetched_count,
                processed = result.processed_count,
                skipped = result.skipped_count,
                failed = result.failed_count,
                truncated = result.truncated,
                "Pipeline run completed"
            );
        } else {
            warn!(
                fetched = result.fetched_count,
                processed = result.processed_count,
                cause = result.failure.as_deref().unwrap_or("unknown"),
                "Pipeline run failed"
            );
        }
        result
    }

    async fn execute(
        &self,
        options: &RunOptions,
        cancel: &CancellationToken,
        result: &mut ExecutionResult,
    ) -> Result<(), RunAbort> {
        let batch_size = options.batch_size.unwrap_or(self.settings.batch_size).max(1);
        let max_items = options.max_items.or(self.settings.max_items);
        let mode = options.validation_mode.unwrap_or(self.settings.validation_mode);
        let policy = RetryPolicy::new(self.settings.max_retries, self.settings.retry_base_delay);
        let deadline = Instant::now() + self.settings.max_runtime;

        let validator = Arc::clone(&self.validator);
        tokio::task::spawn_blocking(move || validator.refresh_context())
            .await
            .map_err(|e| RunAbort::Preflight(format!("context refresh panicked: {e}")))??;

        let (reachable, _) = policy
            .run("validate_connection", SourceError::is_transient, || {
                self.source.validate_connection()
            })
            .await;
        if !reachable? {
            return Err(RunAbort::Preflight(format!(
                "source '{}' failed its connection check",
                self.source.identifier()
            )));
        }

        let mut cursor = options.cursor.clone();
        let mut score_sum = 0.0;
        let mut score_count = 0usize;
        let mut batch = 0u64;

        loop {
            if cancel.is_cancelled() {
                result.cancelled = true;
                return Err(RunAbort::Cancelled);
            }
            if Instant::now() >= deadline {
                info!(batches = batch, "Runtime budget exhausted; stopping after last batch");
                result.truncated = true;
                return Ok(());
            }

            let want = match max_items {
                Some(max) => batch_size.min(max.saturating_sub(result.fetched_count)),
                None => batch_size,
            };
            self.transition(PipelineState::Fetching)?;
            let Assembled {
                items,
                cursor: next_cursor,
                exhausted,
                out_of_time,
            } = self.assemble_batch(&cursor, want, &policy, deadline).await?;
            if items.is_empty() {
                cursor = next_cursor;
                result.next_cursor = cursor;
                return Ok(());
            }
            batch += 1;
            result.fetched_count += items.len();
            debug!(batch, items = items.len(), cursor = %cursor, "Batch assembled");

            self.transition(PipelineState::Validating)?;
            let verdicts: Vec<ValidationResult> = items
                .iter()
                .map(|item| self.validator.validate_in(item, mode))
                .collect();

            self.transition(PipelineState::Processing)?;
            let staged = self.process_batch(&items, &verdicts).await;

            self.transition(PipelineState::Storing)?;
            let outcomes = self.store_batch(staged, &policy).await;

            for ((item, verdict), outcome) in items.iter().zip(&verdicts).zip(outcomes) {
                if let Some(score) = verdict.score {
                    score_sum += score;
                    score_count += 1;
                }
                for issue in &verdict.warnings {
                    result.warnings.push(ItemWarning {
                        item_ref: item.item_ref.clone(),
                        message: issue.to_string(),
                    });
                }
                match outcome {
                    ItemOutcome::Invalid => {
                        result.skipped_count += 1;
                        let cause = verdict
                            .errors
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join("; ");
                        result.errors.push(ItemError {
                            item_ref: item.item_ref.clone(),
                            kind: ItemErrorKind::Validation,
                            cause,
                        });
                    }
                    ItemOutcome::Skipped => result.skipped_count += 1,
                    ItemOutcome::Failed {
                        kind,
                        cause,
                        retries,
                    } => {
                        result.failed_count += 1;
                        if retries > 0 {
                            result.item_retries.insert(item.item_ref.clone(), retries);
                        }
                        result.errors.push(ItemError {
                            item_ref: item.item_ref.clone(),
                            kind,
                            cause,
                        });
                    }
                    ItemOutcome::Stored { warnings, retries } => {
                        result.processed_count += 1;
                        if retries > 0 {
                            result.item_retries.insert(item.item_ref.clone(), retries);
                        }
                        result
                            .warnings
                            .extend(warnings.into_iter().map(|message| ItemWarning {
                                item_ref: item.item_ref.clone(),
                                message,
                            }));
                    }
                }
            }
            result.average_score = (score_count > 0).then(|| score_sum / score_count as f64);

            cursor = next_cursor;
            result.next_cursor = cursor.clone();
            if let Some(checkpoint) = &options.checkpoint {
                checkpoint(&cursor);
            }
            debug!(
                batch,
                processed = result.processed_count,
                skipped = result.skipped_count,
                failed = result.failed_count,
                "Batch committed"
            );

            if exhausted || max_items.is_some_and(|max| result.fetched_count >= max) {
                return Ok(());
            }
            if out_of_time {
                info!(batches = batch, "Runtime budget exhausted mid-batch; stopping");
                result.truncated = true;
                return Ok(());
            }
        }
    }

    /// Fetch pages until `want` items are in hand, the source runs dry, or the
    /// deadline passes with at least one item fetched.
    async fn assemble_batch(
        &self,
        start: &Cursor,
        want: usize,
        policy: &RetryPolicy,
        deadline: Instant,
    ) -> Result<Assembled, SourceError> {
        let mut items = Vec::with_capacity(want);
        let mut cursor = start.clone();
        loop {
            let limit = want - items.len();
            let (page, retries) = policy
                .run("fetch_batch", SourceError::is_transient, || async {
                    self.throttle().await;
                    self.source.fetch_batch(&cursor, limit).await
                })
                .await;
            if retries > 0 {
                debug!(retries, cursor = %cursor, "Fetch succeeded after retries");
            }
            let page = page?;
            let fetched = page.items.len();
            items.extend(page.items);
            cursor = page.next_cursor;
            if !page.has_more || fetched == 0 {
                return Ok(Assembled::new(items, cursor, true, false));
            }
            if items.len() >= want {
                return Ok(Assembled::new(items, cursor, false, false));
            }
            if !items.is_empty() && Instant::now() >= deadline {
                debug!(items = items.len(), "Deadline reached while assembling batch");
                return Ok(Assembled::new(items, cursor, false, true));
            }
        }
    }

    async fn process_batch(&self, items: &[RawItem], verdicts: &[ValidationResult]) -> Vec<Staged> {
        // Index the slices inside the closure; zipped reference tuples make the
        // run future fail the `Send` check when spawned.
        stream::iter(0..items.len())
            .map(|i| {
                let (item, valid) = (&items[i], verdicts[i].valid);
                async move {
                    if !valid {
                        return Staged::Invalid;
                    }
                    match self.processor.process_item(item).await {
                        Ok(Some(record)) => Staged::Ready(record),
                        Ok(None) => Staged::Skipped,
                        Err(e) => {
                            debug!(item_ref = %item.item_ref, error = %e, "Process hook failed");
                            Staged::ProcessFailed(e.message)
                        }
                    }
                }
            })
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await
    }

    async fn store_batch(&self, staged: Vec<Staged>, policy: &RetryPolicy) -> Vec<ItemOutcome> {
        stream::iter(staged)
            .map(|stage| async move {
                match stage {
                    Staged::Invalid => ItemOutcome::Invalid,
                    Staged::Skipped => ItemOutcome::Skipped,
                    Staged::ProcessFailed(cause) => ItemOutcome::Failed {
                        kind: ItemErrorKind::Process,
                        cause,
                        retries: 0,
                    },
                    Staged::Ready(record) => {
                        let (stored, retries) = self.store_with_retry(&record, policy).await;
                        match stored {
                            Ok(()) => ItemOutcome::Stored {
                                warnings: record.warnings,
                                retries,
                            },
                            Err(e) => {
                                warn!(
                                    item_ref = %record.item_ref,
                                    retries,
                                    error = %e,
                                    "Store failed"
                                );
                                ItemOutcome::Failed {
                                    kind: ItemErrorKind::Store,
                                    cause: e.to_string(),
                                    retries,
                                }
                            }
                        }
                    }
                }
            })
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await
    }

    async fn store_with_retry(
        &self,
        record: &ProcessedRecord,
        policy: &RetryPolicy,
    ) -> (Result<(), StoreError>, u32) {
        policy
            .run("store_item", StoreError::is_transient, || async {
                self.throttle().await;
                self.store.store_item(record).await
            })
            .await
    }

    async fn throttle(&self) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }
    }
}
