//! Data sources: where raw items come from.
//!
//! A source is a restartable, lazily paginated sequence of [`RawItem`]s.
//! `fetch_batch` never has side effects, so fetching the same cursor twice
//! yields the same items.

pub mod api;
pub mod file;
pub mod table;

pub use api::ApiSource;
pub use file::FileSource;
pub use table::TableSource;

use crate::error::{ConfigError, SourceError};
use crate::types::{Cursor, FetchPage, RawItem};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

/// Trait for paginated item sources.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Human-readable identifier, used in logs and item references.
    fn identifier(&self) -> String;

    /// Pre-flight check run before the first fetch of every run.
    async fn validate_connection(&self) -> Result<bool, SourceError>;

    /// Fetch up to `limit` items starting at `cursor`.
    async fn fetch_batch(&self, cursor: &Cursor, limit: usize) -> Result<FetchPage, SourceError>;
}

/// Layout of a file source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    /// Picked from the extension: `.jsonl`/`.ndjson`, `.csv`, `.tsv`, otherwise JSON.
    #[default]
    Auto,
    Json,
    Jsonl,
    /// Comma-separated with a header row.
    Csv,
    /// Tab-separated with a header row.
    Tsv,
}

/// Declarative source selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    Api {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bearer_token: Option<String>,
        /// Key holding the item array when the body is an object.
        #[serde(default = "default_items_field")]
        items_field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id_field: Option<String>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    File {
        path: PathBuf,
        #[serde(default)]
        format: FileFormat,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id_field: Option<String>,
    },
    Table {
        database: PathBuf,
        table: String,
        /// Equality filters applied to every page.
        #[serde(default)]
        filters: BTreeMap<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id_field: Option<String>,
    },
}

fn default_items_field() -> String {
    "items".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Build a data source from its declarative spec. Relative paths resolve against `base_dir`.
pub fn build_source(
    spec: &SourceSpec,
    base_dir: &Path,
) -> Result<Arc<dyn DataSource>, ConfigError> {
    match spec {
        SourceSpec::Api {
            url,
            bearer_token,
            items_field,
            id_field,
            timeout_secs,
        } => {
            let timeout = std::time::Duration::from_secs(*timeout_secs);
            let source = ApiSource::new(url.clone(), timeout)?
                .with_bearer_token(bearer_token.clone())
                .with_items_field(items_field.clone())
                .with_id_field(id_field.clone());
            Ok(Arc::new(source))
        }
        SourceSpec::File {
            path,
            format,
            id_field,
        } => Ok(Arc::new(
            FileSource::new(resolve_path(base_dir, path), *format).with_id_field(id_field.clone()),
        )),
        SourceSpec::Table {
            database,
            table,
            filters,
            id_field,
        } => {
            let source = TableSource::new(resolve_path(base_dir, database), table.clone())?
                .with_filters(filters.clone())?
                .with_id_field(id_field.clone());
            Ok(Arc::new(source))
        }
    }
}

pub(crate) fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("static regex"));

/// SQL identifiers are interpolated into queries, so only plain names are accepted.
pub(crate) fn validate_identifier(name: &str) -> Result<(), ConfigError> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            message: format!("'{name}' is not a valid SQL identifier"),
        })
    }
}

/// Item reference: the `id_field` value when present, otherwise `fallback`.
pub(crate) fn item_ref_for(payload: &Value, id_field: Option<&str>, fallback: String) -> String {
    let Some(field) = id_field else {
        return fallback;
    };
    match payload.get(field) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => fallback,
    }
}

/// Slice a fully materialized record list by offset cursor.
pub(crate) fn page_by_offset(
    source_id: &str,
    records: &[RawItem],
    cursor: &Cursor,
    limit: usize,
) -> Result<FetchPage, SourceError> {
    let offset = cursor
        .as_offset()
        .ok_or_else(|| SourceError::InvalidCursor {
            source_id: source_id.to_string(),
            cursor: cursor.as_str().to_string(),
        })? as usize;
    if offset >= records.len() {
        return Ok(FetchPage::empty(cursor.clone()));
    }
    let end = offset.saturating_add(limit).min(records.len());
    Ok(FetchPage {
        items: records[offset..end].to_vec(),
        next_cursor: Cursor::from_offset(end as u64),
        has_more: end < records.len(),
    })
}
