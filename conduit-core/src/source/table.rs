//! SQLite table source with keyset pagination on `rowid`.

use super::{DataSource, item_ref_for, validate_identifier};
use crate::error::{ConfigError, SourceError};
use crate::types::{Cursor, FetchPage, RawItem};
use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, ErrorCode, OpenFlags};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Reads an existing table page by page. The cursor is the last `rowid` returned.
#[derive(Clone)]
pub struct TableSource {
    database: PathBuf,
    table: String,
    filters: Vec<(String, SqlValue)>,
    id_field: Option<String>,
}

impl TableSource {
    pub fn new(
        database: impl Into<PathBuf>,
        table: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self {
            database: database.into(),
            table,
            filters: Vec::new(),
            id_field: None,
        })
    }

    /// Equality filters on plain columns. Only scalar JSON values are accepted.
    pub fn with_filters(mut self, filters: BTreeMap<String, Value>) -> Result<Self, ConfigError> {
        let mut converted = Vec::with_capacity(filters.len());
        for (column, value) in filters {
            validate_identifier(&column)?;
            let sql = match value {
                Value::Null => SqlValue::Null,
                Value::Bool(b) => SqlValue::Integer(i64::from(b)),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => SqlValue::Integer(i),
                    None => SqlValue::Real(n.as_f64().unwrap_or_default()),
                },
                Value::String(s) => SqlValue::Text(s),
                other => {
                    return Err(ConfigError::Invalid {
                        message: format!("filter on '{column}' must be a scalar, got {other}"),
                    });
                }
            };
            converted.push((column, sql));
        }
        self.filters = converted;
        Ok(self)
    }

    pub fn with_id_field(mut self, id_field: Option<String>) -> Self {
        self.id_field = id_field;
        self
    }

    fn query_sql(&self) -> String {
        let mut sql = format!(
            "SELECT rowid AS __conduit_rowid, * FROM \"{}\" WHERE rowid > ?",
            self.table
        );
        for (column, value) in &self.filters {
            if matches!(value, SqlValue::Null) {
                sql.push_str(&format!(" AND \"{column}\" IS NULL"));
            } else {
                sql.push_str(&format!(" AND \"{column}\" = ?"));
            }
        }
        sql.push_str(" ORDER BY rowid LIMIT ?");
        sql
    }

    fn fetch_blocking(&self, after: i64, limit: usize) -> Result<FetchPage, SourceError> {
        let conn = open_read_only(&self.database).map_err(|e| self.map_sql_error(e))?;
        let sql = self.query_sql();
        let mut stmt = conn.prepare(&sql).map_err(|e| self.map_sql_error(e))?;

        let mut params: Vec<SqlValue> = vec![SqlValue::Integer(after)];
        params.extend(
            self.filters
                .iter()
                .filter(|(_, v)| !matches!(v, SqlValue::Null))
                .map(|(_, v)| v.clone()),
        );
        params.push(SqlValue::Integer(limit as i64));

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params))
            .map_err(|e| self.map_sql_error(e))?;

        let mut items = Vec::new();
        let mut last_rowid = after;
        while let Some(row) = rows.next().map_err(|e| self.map_sql_error(e))? {
            let rowid: i64 = row.get(0).map_err(|e| self.map_sql_error(e))?;
            let mut payload = Map::new();
            for (i, name) in columns.iter().enumerate().skip(1) {
                let value = row.get_ref(i).map(sql_to_json).unwrap_or(Value::Null);
                payload.insert(name.clone(), value);
            }
            let payload = Value::Object(payload);
            let fallback = format!("{}:{rowid}", self.table);
            items.push(RawItem::new(
                item_ref_for(&payload, self.id_field.as_deref(), fallback),
                payload,
            ));
            last_rowid = rowid;
        }

        let has_more = items.len() >= limit && limit > 0;
        let next_cursor = if items.is_empty() && after == 0 {
            Cursor::start()
        } else {
            Cursor::new(last_rowid.to_string())
        };
        Ok(FetchPage {
            items,
            next_cursor,
            has_more,
        })
    }

    fn map_sql_error(&self, error: rusqlite::Error) -> SourceError {
        let source_id = self.identifier();
        let message = error.to_string();
        match error.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                SourceError::Connection { source_id, message }
            }
            Some(ErrorCode::CannotOpen) => SourceError::Unavailable { source_id, message },
            _ => SourceError::Protocol { source_id, message },
        }
    }
}

pub(crate) fn open_read_only(path: &std::path::Path) -> rusqlite::Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
}

pub(crate) fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::from(n),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Value::String("<blob>".to_string()),
    }
}

#[async_trait]
impl DataSource for TableSource {
    fn identifier(&self) -> String {
        format!("table:{}/{}", self.database.display(), self.table)
    }

    async fn validate_connection(&self) -> Result<bool, SourceError> {
        let database = self.database.clone();
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || {
            let Ok(conn) = open_read_only(&database) else {
                return false;
            };
            conn.query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [&table],
                |_| Ok(()),
            )
            .is_ok()
        })
        .await
        .map_err(|e| SourceError::Unavailable {
            source_id: self.identifier(),
            message: format!("SQLite task join error: {e}"),
        })
    }

    async fn fetch_batch(&self, cursor: &Cursor, limit: usize) -> Result<FetchPage, SourceError> {
        let after: i64 = if cursor.is_start() {
            0
        } else {
            cursor.as_str().parse().map_err(|_| SourceError::InvalidCursor {
                source_id: self.identifier(),
                cursor: cursor.as_str().to_string(),
            })?
        };
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.fetch_blocking(after, limit))
            .await
            .map_err(|e| SourceError::Unavailable {
                source_id: self.identifier(),
                message: format!("SQLite task join error: {e}"),
            })?
    }
}
