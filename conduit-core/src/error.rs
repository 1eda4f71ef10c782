//! Error types for the Conduit core.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering data sources, storage hooks, processing hooks, configuration,
//! pipeline execution, and run-state persistence.

use std::path::PathBuf;

/// Top-level error type for the Conduit core library.
#[derive(Debug, thiserror::Error)]
pub enum ConduitError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while acquiring items from a data source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("Connection to '{source_id}' failed: {message}")]
    Connection { source_id: String, message: String },

    #[error("Authentication rejected by '{source_id}': {message}")]
    Auth { source_id: String, message: String },

    #[error("Source '{source_id}' is unavailable: {message}")]
    Unavailable { source_id: String, message: String },

    #[error("Unexpected response from '{source_id}': {message}")]
    Protocol { source_id: String, message: String },

    #[error("Invalid cursor '{cursor}' for source '{source_id}'")]
    InvalidCursor { source_id: String, cursor: String },
}

impl SourceError {
    /// Whether the failure is transient and the fetch may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Connection { .. })
    }
}

/// Typed failure returned by a store hook.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("permanent storage failure: {0}")]
    Permanent(String),
}

impl StoreError {
    /// Only transient failures are retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Failure raised by a process hook. Counted as a per-item failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("processing '{item_ref}' failed: {message}")]
pub struct ProcessError {
    pub item_ref: String,
    pub message: String,
}

/// Errors from a content extractor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtractError {
    #[error("content could not be parsed: {0}")]
    Parse(String),

    #[error("extractor failed: {0}")]
    Other(String),
}

/// Errors from an annotator. Never fatal for the item.
#[derive(Debug, Clone, thiserror::Error)]
#[error("annotation failed: {0}")]
pub struct AnnotateError(pub String);

/// Errors from the configuration system.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },

    #[error("Duplicate pipeline id: {id}")]
    DuplicatePipeline { id: String },

    #[error("Pipeline '{id}' depends on unknown pipeline '{dependency}'")]
    UnknownDependency { id: String, dependency: String },

    #[error("Pipeline '{id}' is part of a dependency cycle: {}", cycle.join(" -> "))]
    DependencyCycle { id: String, cycle: Vec<String> },

    #[error("Pipeline '{id}' depends on excluded pipeline '{dependency}'")]
    ExcludedDependency { id: String, dependency: String },

    #[error("Pipeline '{id}' could not be built: {message}")]
    Build { id: String, message: String },
}

/// Errors from the pipeline manager and pipeline runs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("Pipeline not found: {id}")]
    NotFound { id: String },

    #[error("Pipeline '{id}' is disabled")]
    Disabled { id: String },

    #[error("Pipeline '{id}' is already running")]
    AlreadyRunning { id: String },

    #[error("Dependencies of '{id}' are not satisfied: {}", waiting_on.join(", "))]
    DependenciesNotSatisfied { id: String, waiting_on: Vec<String> },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Manager has been shut down")]
    ShutDown,
}

/// Errors from run-state persistence.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Failed to persist run state: {message}")]
    PersistenceError { message: String },

    #[error("Failed to load run state from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },
}

/// A type alias for results using the top-level `ConduitError`.
pub type Result<T> = std::result::Result<T, ConduitError>;
