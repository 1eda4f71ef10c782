//! Local file source: JSON array, single JSON object, JSON Lines, or delimited text.

use super::{DataSource, FileFormat, item_ref_for, page_by_offset};
use crate::error::SourceError;
use crate::types::{Cursor, FetchPage, RawItem};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::debug;

/// Reads records from a local file. The cursor is the record offset.
///
/// The parsed file is cached until its modification time changes.
pub struct FileSource {
    path: PathBuf,
    format: FileFormat,
    id_field: Option<String>,
    cache: Mutex<Option<(SystemTime, Arc<Vec<RawItem>>)>>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, format: FileFormat) -> Self {
        Self {
            path: path.into(),
            format,
            id_field: None,
            cache: Mutex::new(None),
        }
    }

    pub fn with_id_field(mut self, id_field: Option<String>) -> Self {
        self.id_field = id_field;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The concrete layout; never `Auto`.
    fn resolved_format(&self) -> FileFormat {
        if self.format != FileFormat::Auto {
            return self.format;
        }
        let ext = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("jsonl" | "ndjson") => FileFormat::Jsonl,
            Some("csv") => FileFormat::Csv,
            Some("tsv") => FileFormat::Tsv,
            _ => FileFormat::Json,
        }
    }

    fn unavailable(&self, message: String) -> SourceError {
        SourceError::Unavailable {
            source_id: self.identifier(),
            message,
        }
    }

    async fn records(&self) -> Result<Arc<Vec<RawItem>>, SourceError> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| self.unavailable(format!("{}: {e}", self.path.display())))?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        if let Ok(cache) = self.cache.lock() {
            if let Some((stamp, records)) = cache.as_ref() {
                if *stamp == modified {
                    return Ok(Arc::clone(records));
                }
            }
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.unavailable(format!("{}: {e}", self.path.display())))?;
        let records = match self.resolved_format() {
            FileFormat::Jsonl => self.parse_lines(&content),
            FileFormat::Csv => self.parse_delimited(&content, b',')?,
            FileFormat::Tsv => self.parse_delimited(&content, b'\t')?,
            FileFormat::Json | FileFormat::Auto => self.parse_document(&content)?,
        };
        debug!(path = %self.path.display(), records = records.len(), "Loaded file source");

        let records = Arc::new(records);
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some((modified, Arc::clone(&records)));
        }
        Ok(records)
    }

    fn fallback_ref(&self, index: usize) -> String {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string());
        format!("{name}:{index}")
    }

    /// Each non-blank line is one record. Unparseable lines are kept as malformed items.
    fn parse_lines(&self, content: &str) -> Vec<RawItem> {
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(index, line)| match serde_json::from_str::<Value>(line) {
                Ok(payload) => {
                    let item_ref =
                        item_ref_for(&payload, self.id_field.as_deref(), self.fallback_ref(index));
                    RawItem::new(item_ref, payload)
                }
                Err(e) => RawItem::malformed(self.fallback_ref(index), line, e.to_string()),
            })
            .collect()
    }

    /// The first row names the fields; every value is kept as a string.
    ///
    /// Rows that fail to parse, including rows with the wrong field count, are
    /// kept as malformed items carrying the offending line.
    fn parse_delimited(&self, content: &str, delimiter: u8) -> Result<Vec<RawItem>, SourceError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(false)
            .from_reader(content.as_bytes());
        let headers = reader
            .headers()
            .map_err(|e| SourceError::Protocol {
                source_id: self.identifier(),
                message: format!("invalid header row: {e}"),
            })?
            .clone();

        Ok(reader
            .records()
            .enumerate()
            .map(|(index, row)| match row {
                Ok(row) => {
                    let payload: Map<String, Value> = headers
                        .iter()
                        .zip(row.iter())
                        .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
                        .collect();
                    let payload = Value::Object(payload);
                    let item_ref =
                        item_ref_for(&payload, self.id_field.as_deref(), self.fallback_ref(index));
                    RawItem::new(item_ref, payload)
                }
                Err(e) => {
                    let raw = e
                        .position()
                        .and_then(|pos| content.lines().nth(pos.line().saturating_sub(1) as usize))
                        .unwrap_or_default();
                    RawItem::malformed(self.fallback_ref(index), raw, e.to_string())
                }
            })
            .collect())
    }

    fn parse_document(&self, content: &str) -> Result<Vec<RawItem>, SourceError> {
        let doc: Value = serde_json::from_str(content).map_err(|e| SourceError::Protocol {
            source_id: self.identifier(),
            message: format!("invalid JSON document: {e}"),
        })?;
        let values = match doc {
            Value::Array(values) => values,
            single => vec![single],
        };
        Ok(values
            .into_iter()
            .enumerate()
            .map(|(index, payload)| {
                let item_ref =
                    item_ref_for(&payload, self.id_field.as_deref(), self.fallback_ref(index));
                RawItem::new(item_ref, payload)
            })
            .collect())
    }
}

#[async_trait]
impl DataSource for FileSource {
    fn identifier(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn validate_connection(&self) -> Result<bool, SourceError> {
        Ok(tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }

    async fn fetch_batch(&self, cursor: &Cursor, limit: usize) -> Result<FetchPage, SourceError> {
        let records = self.records().await?;
        page_by_offset(&self.identifier(), &records, cursor, limit)
    }
}
