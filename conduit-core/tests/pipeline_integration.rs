//! End-to-end pipeline runs: counting, retries, isolation, truncation, cancellation.

mod common;

use common::{BrokenSource, JitterProcessor, MemorySource, ScriptedStore, SlowProcessor};
use conduit_core::error::SourceError;
use conduit_core::pipeline::{
    JsonlSink, PassthroughProcessor, Pipeline, PipelineSettings, RateLimiter, RunOptions,
    build_processor,
};
use conduit_core::source::{FileFormat, FileSource};
use conduit_core::validation::{CompletenessValidator, ContentQualityValidator};
use conduit_core::{
    CompositeValidator, Cursor, ItemErrorKind, PipelineState, ProcessedRecord, ProcessorSpec,
    RawItem, ValidationMode,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn require(fields: &[&str]) -> CompositeValidator {
    let validator = CompletenessValidator::new(
        fields.iter().map(|f| f.to_string()).collect(),
        Vec::new(),
        &BTreeMap::new(),
    )
    .unwrap();
    CompositeValidator::new(vec![Box::new(validator)], ValidationMode::Strict)
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        retry_base_delay: Duration::from_millis(10),
        ..PipelineSettings::default()
    }
}

#[tokio::test]
async fn test_missing_required_field_is_skipped_not_failed() {
    let mut items: Vec<RawItem> = (1..=5)
        .map(|i| RawItem::new(format!("doc-{i}"), json!({"id": i, "title": format!("Doc {i}")})))
        .collect();
    items[2] = RawItem::new("doc-3", json!({"id": 3}));

    let store = Arc::new(ScriptedStore::new());
    let pipeline = Pipeline::new(
        "scenario-a",
        Arc::new(MemorySource::new(items)),
        require(&["title"]),
        Arc::new(PassthroughProcessor::new(None)),
        store.clone(),
        settings(),
    );
    let result = pipeline.run(RunOptions::default(), CancellationToken::new()).await;

    assert_eq!(result.state, PipelineState::Completed);
    assert_eq!(
        (
            result.fetched_count,
            result.processed_count,
            result.skipped_count,
            result.failed_count
        ),
        (5, 4, 1, 0)
    );
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].item_ref, "doc-3");
    assert_eq!(result.errors[0].kind, ItemErrorKind::Validation);
    assert!(result.errors[0].cause.contains("missing_required"));
    assert_eq!(store.stored(), vec!["doc-1", "doc-2", "doc-4", "doc-5"]);
}

#[tokio::test(start_paused = true)]
async fn test_runtime_budget_truncates_after_in_flight_batch() {
    // 15 items at 1s each, 5 per batch: 15s of work against a 10s budget.
    let pipeline = Pipeline::new(
        "scenario-b",
        Arc::new(MemorySource::numbered(15)),
        CompositeValidator::empty(),
        Arc::new(SlowProcessor {
            delay: Duration::from_secs(1),
        }),
        Arc::new(ScriptedStore::new()),
        PipelineSettings {
            batch_size: 5,
            concurrency: 1,
            max_runtime: Duration::from_secs(10),
            ..settings()
        },
    );
    let result = pipeline.run(RunOptions::default(), CancellationToken::new()).await;

    assert!(result.truncated);
    assert_eq!(result.state, PipelineState::Completed);
    assert_eq!(result.fetched_count, 10);
    assert_eq!(result.processed_count, 10);
    assert!(result.is_conserved());
    assert_eq!(result.next_cursor, Cursor::from_offset(10));
}

#[tokio::test(start_paused = true)]
async fn test_transient_store_failures_are_retried_within_bound() {
    let store = Arc::new(ScriptedStore::new().flaky("item-1", 2));
    let pipeline = Pipeline::new(
        "retry",
        Arc::new(MemorySource::numbered(3)),
        CompositeValidator::empty(),
        Arc::new(PassthroughProcessor::new(None)),
        store.clone(),
        PipelineSettings {
            max_retries: 2,
            ..settings()
        },
    );
    let result = pipeline.run(RunOptions::default(), CancellationToken::new()).await;

    assert_eq!(result.processed_count, 3);
    assert_eq!(result.failed_count, 0);
    assert_eq!(result.item_retries.get("item-1"), Some(&2));
    assert_eq!(result.item_retries.len(), 1);
    assert_eq!(result.total_retries(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_only_that_item() {
    let store = Arc::new(ScriptedStore::new().flaky("item-0", 5).broken("item-2"));
    let pipeline = Pipeline::new(
        "isolation",
        Arc::new(MemorySource::numbered(4)),
        CompositeValidator::empty(),
        Arc::new(PassthroughProcessor::new(None)),
        store.clone(),
        PipelineSettings {
            max_retries: 2,
            ..settings()
        },
    );
    let result = pipeline.run(RunOptions::default(), CancellationToken::new()).await;

    assert!(result.is_success());
    assert_eq!(result.processed_count, 2);
    assert_eq!(result.failed_count, 2);
    assert_eq!(result.item_retries.get("item-0"), Some(&2));
    assert!(!result.item_retries.contains_key("item-2"));
    let failed: Vec<(&str, ItemErrorKind)> = result
        .errors
        .iter()
        .map(|e| (e.item_ref.as_str(), e.kind))
        .collect();
    assert_eq!(
        failed,
        vec![("item-0", ItemErrorKind::Store), ("item-2", ItemErrorKind::Store)]
    );
    assert_eq!(store.stored(), vec!["item-1", "item-3"]);
}

#[tokio::test(start_paused = true)]
async fn test_results_stay_in_fetch_order_under_concurrency() {
    let items: Vec<RawItem> = (0..8)
        .map(|i| {
            RawItem::new(
                format!("item-{i}"),
                json!({"delay_ms": (8 - i) * 100, "fail": i % 3 == 0}),
            )
        })
        .collect();
    let pipeline = Pipeline::new(
        "ordered",
        Arc::new(MemorySource::new(items)),
        CompositeValidator::empty(),
        Arc::new(JitterProcessor),
        Arc::new(ScriptedStore::new()),
        PipelineSettings {
            concurrency: 4,
            ..settings()
        },
    );
    let result = pipeline.run(RunOptions::default(), CancellationToken::new()).await;

    let refs: Vec<&str> = result.errors.iter().map(|e| e.item_ref.as_str()).collect();
    assert_eq!(refs, vec!["item-0", "item-3", "item-6"]);
    assert!(result.errors.iter().all(|e| e.kind == ItemErrorKind::Process));
    assert_eq!(result.processed_count, 5);
}

#[tokio::test]
async fn test_cancellation_between_batches() {
    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    let pipeline = Pipeline::new(
        "cancel",
        Arc::new(MemorySource::numbered(10)),
        CompositeValidator::empty(),
        Arc::new(PassthroughProcessor::new(None)),
        Arc::new(ScriptedStore::new()),
        PipelineSettings {
            batch_size: 4,
            ..settings()
        },
    );
    let options = RunOptions {
        checkpoint: Some(Arc::new(move |_: &Cursor| trip.cancel())),
        ..RunOptions::default()
    };
    let result = pipeline.run(options, cancel).await;

    assert!(result.cancelled);
    assert_eq!(result.state, PipelineState::Failed);
    assert_eq!(result.failure.as_deref(), Some("cancelled"));
    assert_eq!(result.fetched_count, 4);
    assert!(result.is_conserved());
    assert_eq!(result.next_cursor, Cursor::from_offset(4));
}

#[tokio::test]
async fn test_auth_error_aborts_run() {
    let pipeline = Pipeline::new(
        "auth",
        Arc::new(BrokenSource(SourceError::Auth {
            source_id: "broken".into(),
            message: "HTTP 401".into(),
        })),
        CompositeValidator::empty(),
        Arc::new(PassthroughProcessor::new(None)),
        Arc::new(ScriptedStore::new()),
        settings(),
    );
    let result = pipeline.run(RunOptions::default(), CancellationToken::new()).await;

    assert_eq!(result.state, PipelineState::Failed);
    assert!(result.failure.unwrap().contains("Authentication rejected"));
    assert_eq!(result.fetched_count, 0);
}

#[tokio::test]
async fn test_lenient_mode_reports_all_validators() {
    let items = vec![RawItem::new("x", json!({"text": "short"}))];
    let validators = CompositeValidator::new(
        vec![
            Box::new(
                CompletenessValidator::new(vec!["title".into()], Vec::new(), &BTreeMap::new())
                    .unwrap(),
            ),
            Box::new(ContentQualityValidator::new(["protein"]).with_length_bounds(100, None)),
        ],
        ValidationMode::Strict,
    );
    let pipeline = Pipeline::new(
        "lenient",
        Arc::new(MemorySource::new(items)),
        validators,
        Arc::new(PassthroughProcessor::new(None)),
        Arc::new(ScriptedStore::new()),
        settings(),
    );

    let strict = pipeline.run(RunOptions::default(), CancellationToken::new()).await;
    assert!(!strict.errors[0].cause.contains("text_too_short"));

    let lenient = pipeline
        .run(
            RunOptions {
                validation_mode: Some(ValidationMode::Lenient),
                ..RunOptions::default()
            },
            CancellationToken::new(),
        )
        .await;
    assert!(lenient.errors[0].cause.contains("missing_required"));
    assert!(lenient.errors[0].cause.contains("text_too_short"));
    assert_eq!(lenient.skipped_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limiter_spaces_calls() {
    let pipeline = Pipeline::new(
        "throttled",
        Arc::new(MemorySource::numbered(4)),
        CompositeValidator::empty(),
        Arc::new(PassthroughProcessor::new(None)),
        Arc::new(ScriptedStore::new()),
        settings(),
    )
    .with_rate_limiter(Arc::new(RateLimiter::new(3, Duration::from_secs(60))));

    let start = tokio::time::Instant::now();
    let result = pipeline.run(RunOptions::default(), CancellationToken::new()).await;
    // One fetch and four stores: the fourth call waits for the window to slide.
    assert_eq!(result.processed_count, 4);
    assert!(start.elapsed() >= Duration::from_secs(60));
}

#[tokio::test]
async fn test_jsonl_file_to_jsonl_sink_with_document_processor() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("docs.jsonl");
    std::fs::write(
        &input,
        concat!(
            "{\"id\": \"a\", \"abstract\": \"Cisplatin damages the kidney.\"}\n",
            "{not json}\n",
            "{\"id\": \"b\", \"title\": \"no text here\"}\n",
            "{\"id\": \"c\", \"abstract\": \"Liver enzymes were normal.\"}\n",
        ),
    )
    .unwrap();
    let output = dir.path().join("out").join("records.jsonl");

    let mut keywords = BTreeMap::new();
    keywords.insert("organ".to_string(), vec!["kidney".to_string(), "liver".to_string()]);
    let processor = build_processor(&ProcessorSpec::Document {
        text_fields: vec!["abstract".into()],
        keywords,
    });

    let pipeline = Pipeline::new(
        "docs",
        Arc::new(FileSource::new(&input, FileFormat::Jsonl).with_id_field(Some("id".into()))),
        require(&["id"]),
        processor,
        Arc::new(JsonlSink::new(&output)),
        settings(),
    );
    let result = pipeline.run(RunOptions::default(), CancellationToken::new()).await;

    assert_eq!(result.fetched_count, 4);
    assert_eq!(result.processed_count, 2);
    // The malformed line fails validation; "b" has no text and is a soft skip.
    assert_eq!(result.skipped_count, 2);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].cause.contains("malformed_record"));

    let stored: Vec<ProcessedRecord> = std::fs::read_to_string(&output)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let refs: Vec<&str> = stored.iter().map(|r| r.item_ref.as_str()).collect();
    assert_eq!(refs, vec!["a", "c"]);
    assert_eq!(
        stored[0].annotations,
        Some(json!({"labels": {"organ": ["kidney"]}}))
    );
}
