//! Building runnable pipelines from their declarative configuration.

use crate::config::PipelineConfig;
use crate::error::ConfigError;
use crate::pipeline::{
    Pipeline, PipelineSettings, RateLimiter, build_processor, build_sink,
};
use crate::source::build_source;
use crate::validation::{CompositeValidator, build_validators};
use std::path::PathBuf;
use std::sync::Arc;

pub trait PipelineFactory: Send + Sync {
    fn build(&self, config: &PipelineConfig) -> Result<Pipeline, ConfigError>;
}

impl<F> PipelineFactory for F
where
    F: Fn(&PipelineConfig) -> Result<Pipeline, ConfigError> + Send + Sync,
{
    fn build(&self, config: &PipelineConfig) -> Result<Pipeline, ConfigError> {
        self(config)
    }
}

/// Resolves `SourceSpec`, `ValidatorSpec`, `ProcessorSpec` and `SinkSpec` into
/// concrete components. Relative paths resolve against `base_dir`.
#[derive(Debug, Clone)]
pub struct SpecPipelineFactory {
    base_dir: PathBuf,
}

impl SpecPipelineFactory {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

impl PipelineFactory for SpecPipelineFactory {
    fn build(&self, config: &PipelineConfig) -> Result<Pipeline, ConfigError> {
        let params = &config.parameters;
        let source = build_source(&params.source, &self.base_dir)?;
        let validators = build_validators(&params.validators, &self.base_dir)?;
        let processor = build_processor(&params.processor);
        let store = build_sink(&params.sink, &self.base_dir)?;

        let pipeline = Pipeline::new(
            config.id.clone(),
            source,
            CompositeValidator::new(validators, params.validation_mode),
            processor,
            store,
            PipelineSettings::from_config(config),
        );
        Ok(match params.rate_limit_per_minute {
            Some(limit) if limit > 0 => {
                pipeline.with_rate_limiter(Arc::new(RateLimiter::per_minute(limit)))
            }
            _ => pipeline,
        })
    }
}
