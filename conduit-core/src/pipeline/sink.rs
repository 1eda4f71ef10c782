//! Thin storage adapters implementing [`ItemStore`].

use super::hooks::ItemStore;
use crate::error::StoreError;
use crate::source::resolve_path;
use crate::types::ProcessedRecord;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, ErrorCode, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Declarative sink selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkSpec {
    /// Drop records after counting them.
    #[default]
    Discard,
    /// Append one JSON object per line.
    Jsonl { path: PathBuf },
    /// Upsert into a SQLite table keyed by item reference.
    Sqlite { database: PathBuf, table: String },
}

pub fn build_sink(
    spec: &SinkSpec,
    base_dir: &Path,
) -> Result<Arc<dyn ItemStore>, crate::error::ConfigError> {
    Ok(match spec {
        SinkSpec::Discard => Arc::new(DiscardSink::default()),
        SinkSpec::Jsonl { path } => Arc::new(JsonlSink::new(resolve_path(base_dir, path))),
        SinkSpec::Sqlite { database, table } => Arc::new(SqliteSink::new(
            resolve_path(base_dir, database),
            table.clone(),
        )?),
    })
}

/// Counts records and drops them.
#[derive(Debug, Default)]
pub struct DiscardSink {
    stored: AtomicUsize,
}

impl DiscardSink {
    pub fn stored(&self) -> usize {
        self.stored.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ItemStore for DiscardSink {
    async fn store_item(&self, _record: &ProcessedRecord) -> Result<(), StoreError> {
        self.stored.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Appends records as JSON lines. Writes are serialized so lines never interleave.
pub struct JsonlSink {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

fn classify_io(error: std::io::Error) -> StoreError {
    use std::io::ErrorKind;
    match error.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            StoreError::Transient(error.to_string())
        }
        _ => StoreError::Permanent(error.to_string()),
    }
}

#[async_trait]
impl ItemStore for JsonlSink {
    async fn store_item(&self, record: &ProcessedRecord) -> Result<(), StoreError> {
        let mut line =
            serde_json::to_vec(record).map_err(|e| StoreError::Permanent(e.to_string()))?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(classify_io)?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(classify_io)?;
        file.write_all(&line).await.map_err(classify_io)?;
        file.flush().await.map_err(classify_io)?;
        Ok(())
    }
}

/// Upserts records into
/// `table (item_ref TEXT PRIMARY KEY, data, annotations, warnings, stored_at)`.
///
/// Busy or locked databases are reported as transient so the pipeline retries.
pub struct SqliteSink {
    database: PathBuf,
    table: String,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteSink {
    pub fn new(
        database: impl Into<PathBuf>,
        table: impl Into<String>,
    ) -> Result<Self, crate::error::ConfigError> {
        let table = table.into();
        crate::source::validate_identifier(&table)?;
        Ok(Self {
            database: database.into(),
            table,
            conn: Arc::new(Mutex::new(None)),
        })
    }

    fn open(database: &Path, table: &str) -> rusqlite::Result<Connection> {
        if let Some(parent) = database.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(database)?;
        conn.busy_timeout(Duration::from_millis(250))?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (
                item_ref TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                annotations TEXT,
                warnings TEXT,
                stored_at TEXT NOT NULL
            )"
        ))?;
        Ok(conn)
    }
}

fn classify_sql(error: rusqlite::Error) -> StoreError {
    match error.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            StoreError::Transient(error.to_string())
        }
        _ => StoreError::Permanent(error.to_string()),
    }
}

#[async_trait]
impl ItemStore for SqliteSink {
    async fn store_item(&self, record: &ProcessedRecord) -> Result<(), StoreError> {
        let data = record.data.to_string();
        let annotations = record.annotations.as_ref().map(|a| a.to_string());
        let warnings = if record.warnings.is_empty() {
            None
        } else {
            serde_json::to_string(&record.warnings).ok()
        };
        let item_ref = record.item_ref.clone();
        let database = self.database.clone();
        let table = self.table.clone();
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Permanent("sink connection poisoned".into()))?;
            if guard.is_none() {
                *guard = Some(Self::open(&database, &table).map_err(classify_sql)?);
            }
            let Some(conn) = guard.as_ref() else {
                return Err(StoreError::Permanent("sink connection unavailable".into()));
            };
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO \"{table}\" \
                     (item_ref, data, annotations, warnings, stored_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                params![item_ref, data, annotations, warnings, Utc::now().to_rfc3339()],
            )
            .map_err(classify_sql)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Transient(format!("sink task join error: {e}")))?
    }
}
