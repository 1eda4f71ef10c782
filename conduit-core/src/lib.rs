//! # Conduit Core
//!
//! Core library for the Conduit pipeline orchestrator.
//! Provides data sources, composable validators, the per-run pipeline state
//! machine, the dependency-aware pipeline manager, configuration, and
//! fundamental types.

pub mod config;
pub mod error;
pub mod manager;
pub mod pipeline;
pub mod source;
pub mod types;
pub mod validation;

// Re-export commonly used types at the crate root.
pub use config::{ConduitConfig, PipelineConfig, PipelineParameters, Schedule, SchedulerConfig};
pub use error::{
    ConduitError, ConfigError, PipelineError, ProcessError, Result, SourceError, StateError,
    StoreError,
};
pub use manager::{
    LoadReport, PipelineFactory, PipelineManager, PipelineOverview, RunOverrides,
    SpecPipelineFactory,
};
pub use pipeline::{
    ItemProcessor, ItemStore, Pipeline, PipelineSettings, ProcessorSpec, RunOptions, SinkSpec,
};
pub use source::{DataSource, SourceSpec};
pub use types::{
    Cursor, ExecutionResult, FetchPage, ItemError, ItemErrorKind, ItemWarning, PipelineRunState,
    PipelineState, ProcessedRecord, RawItem, RunStatus,
};
pub use validation::{
    CompositeValidator, ValidationIssue, ValidationMode, ValidationResult, Validator,
    ValidatorSpec,
};
