//! Read-only key lookups used by the referential and duplicate validators.

use crate::error::{ConfigError, SourceError};
use crate::source::{resolve_path, validate_identifier};
use crate::source::table::{open_read_only, sql_to_json};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Existence check against some external key set.
pub trait ExistenceCheck: Send + Sync {
    fn exists(&self, key: &str) -> bool;

    /// Reload the key set. Called once at the start of every run.
    fn refresh(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Declarative lookup selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LookupSpec {
    /// A fixed list of keys.
    Static { keys: Vec<String> },
    /// Distinct values of one column, snapshotted at run start.
    Sqlite {
        database: PathBuf,
        table: String,
        column: String,
    },
}

impl LookupSpec {
    pub fn build(&self, base_dir: &Path) -> Result<Arc<dyn ExistenceCheck>, ConfigError> {
        match self {
            LookupSpec::Static { keys } => Ok(Arc::new(StaticKeys::new(keys.iter().cloned()))),
            LookupSpec::Sqlite {
                database,
                table,
                column,
            } => Ok(Arc::new(SqliteKeySnapshot::new(
                resolve_path(base_dir, database),
                table.clone(),
                column.clone(),
            )?)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticKeys {
    keys: HashSet<String>,
}

impl StaticKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl ExistenceCheck for StaticKeys {
    fn exists(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

/// Snapshot of one column's values. A missing table is an empty snapshot.
pub struct SqliteKeySnapshot {
    database: PathBuf,
    table: String,
    column: String,
    keys: RwLock<HashSet<String>>,
}

impl SqliteKeySnapshot {
    pub fn new(
        database: impl Into<PathBuf>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let table = table.into();
        let column = column.into();
        validate_identifier(&table)?;
        validate_identifier(&column)?;
        Ok(Self {
            database: database.into(),
            table,
            column,
            keys: RwLock::new(HashSet::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.keys.read().map(|k| k.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load(&self) -> Result<HashSet<String>, rusqlite::Error> {
        if !self.database.exists() {
            return Ok(HashSet::new());
        }
        let conn = open_read_only(&self.database)?;
        let table_exists = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [&self.table],
                |_| Ok(()),
            )
            .is_ok();
        if !table_exists {
            return Ok(HashSet::new());
        }
        let sql = format!(
            "SELECT DISTINCT \"{}\" FROM \"{}\" WHERE \"{}\" IS NOT NULL",
            self.column, self.table, self.column
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut keys = HashSet::new();
        while let Some(row) = rows.next()? {
            if let Some(key) = super::key_of(&sql_to_json(row.get_ref(0)?)) {
                keys.insert(key);
            }
        }
        Ok(keys)
    }
}

impl ExistenceCheck for SqliteKeySnapshot {
    fn exists(&self, key: &str) -> bool {
        self.keys.read().map(|k| k.contains(key)).unwrap_or(false)
    }

    fn refresh(&self) -> Result<(), SourceError> {
        let keys = self.load().map_err(|e| SourceError::Unavailable {
            source_id: format!("lookup:{}/{}", self.database.display(), self.table),
            message: e.to_string(),
        })?;
        debug!(
            table = %self.table,
            column = %self.column,
            keys = keys.len(),
            "Refreshed key snapshot"
        );
        if let Ok(mut guard) = self.keys.write() {
            *guard = keys;
        }
        Ok(())
    }
}
