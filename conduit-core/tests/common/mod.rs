//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use conduit_core::error::{ProcessError, SourceError, StoreError};
use conduit_core::pipeline::{ItemProcessor, ItemStore};
use conduit_core::source::DataSource;
use conduit_core::{Cursor, FetchPage, ProcessedRecord, RawItem};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// In-memory source paginated by offset.
pub struct MemorySource {
    pub items: Vec<RawItem>,
    pub fetch_calls: AtomicUsize,
}

impl MemorySource {
    pub fn new(items: Vec<RawItem>) -> Self {
        Self {
            items,
            fetch_calls: AtomicUsize::new(0),
        }
    }

    /// `n` items `{ "id": i, "title": "Item i" }`.
    pub fn numbered(n: usize) -> Self {
        Self::new(
            (0..n)
                .map(|i| RawItem::new(format!("item-{i}"), json!({"id": i, "title": format!("Item {i}")})))
                .collect(),
        )
    }
}

#[async_trait]
impl DataSource for MemorySource {
    fn identifier(&self) -> String {
        "memory".to_string()
    }

    async fn validate_connection(&self) -> Result<bool, SourceError> {
        Ok(true)
    }

    async fn fetch_batch(&self, cursor: &Cursor, limit: usize) -> Result<FetchPage, SourceError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let offset = cursor.as_offset().ok_or_else(|| SourceError::InvalidCursor {
            source_id: self.identifier(),
            cursor: cursor.to_string(),
        })? as usize;
        let start = offset.min(self.items.len());
        let end = (start + limit).min(self.items.len());
        Ok(FetchPage {
            items: self.items[start..end].to_vec(),
            next_cursor: Cursor::from_offset(end as u64),
            has_more: end < self.items.len(),
        })
    }
}

/// Source whose every call fails with the given error.
pub struct BrokenSource(pub SourceError);

#[async_trait]
impl DataSource for BrokenSource {
    fn identifier(&self) -> String {
        "broken".to_string()
    }

    async fn validate_connection(&self) -> Result<bool, SourceError> {
        Ok(true)
    }

    async fn fetch_batch(&self, _cursor: &Cursor, _limit: usize) -> Result<FetchPage, SourceError> {
        Err(self.0.clone())
    }
}

/// Passes items through after sleeping `delay` each (paused-clock friendly).
pub struct SlowProcessor {
    pub delay: Duration,
}

#[async_trait]
impl ItemProcessor for SlowProcessor {
    async fn process_item(&self, item: &RawItem) -> Result<Option<ProcessedRecord>, ProcessError> {
        tokio::time::sleep(self.delay).await;
        Ok(Some(ProcessedRecord::new(item.item_ref.clone(), item.payload.clone())))
    }
}

/// Sleeps a per-item delay taken from the payload's `delay_ms`, to shuffle completion order.
pub struct JitterProcessor;

#[async_trait]
impl ItemProcessor for JitterProcessor {
    async fn process_item(&self, item: &RawItem) -> Result<Option<ProcessedRecord>, ProcessError> {
        let ms = item.payload.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        if item.payload.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            return Err(ProcessError {
                item_ref: item.item_ref.clone(),
                message: "rejected by processor".into(),
            });
        }
        Ok(Some(ProcessedRecord::new(item.item_ref.clone(), item.payload.clone())))
    }
}

/// Records stored items; can fail chosen items transiently or permanently.
#[derive(Default)]
pub struct ScriptedStore {
    transient: Mutex<HashMap<String, u32>>,
    permanent: HashSet<String>,
    pub stored: Mutex<Vec<String>>,
    pub attempts: AtomicUsize,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `item_ref` transiently `times` times before succeeding.
    pub fn flaky(self, item_ref: &str, times: u32) -> Self {
        if let Ok(mut map) = self.transient.lock() {
            map.insert(item_ref.to_string(), times);
        }
        self
    }

    pub fn broken(mut self, item_ref: &str) -> Self {
        self.permanent.insert(item_ref.to_string());
        self
    }

    pub fn stored(&self) -> Vec<String> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl ItemStore for ScriptedStore {
    async fn store_item(&self, record: &ProcessedRecord) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.permanent.contains(&record.item_ref) {
            return Err(StoreError::Permanent(format!("constraint violation on {}", record.item_ref)));
        }
        {
            let mut transient = self.transient.lock().unwrap();
            if let Some(left) = transient.get_mut(&record.item_ref) {
                if *left > 0 {
                    *left -= 1;
                    return Err(StoreError::Transient("database is locked".into()));
                }
            }
        }
        self.stored.lock().unwrap().push(record.item_ref.clone());
        Ok(())
    }
}
