//! Validation framework.
//!
//! Validators are pure functions of a [`RawItem`] plus read-only context. They
//! report blocking errors, non-blocking warnings, and an optional quality score.
//! [`CompositeValidator`] chains them in order.

pub mod completeness;
pub mod duplicate;
pub mod lookup;
pub mod quality;
pub mod referential;
pub mod schema;

pub use completeness::CompletenessValidator;
pub use duplicate::DuplicateValidator;
pub use lookup::{ExistenceCheck, LookupSpec, SqliteKeySnapshot, StaticKeys};
pub use quality::ContentQualityValidator;
pub use referential::ReferentialIntegrityValidator;
pub use schema::{FieldSpec, FieldType, SchemaValidator};

use crate::error::{ConfigError, SourceError};
use crate::types::RawItem;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// A single finding reported by a validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ValidationIssue {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
        }
    }

    pub fn for_field(
        code: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{} [{}]: {}", self.code, field, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

/// Result of validating one item. `valid` is true exactly when `errors` is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::pass()
    }
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            score: None,
        }
    }

    pub fn fail(issue: ValidationIssue) -> Self {
        let mut result = Self::pass();
        result.error(issue);
        result
    }

    pub fn error(&mut self, issue: ValidationIssue) {
        self.errors.push(issue);
        self.valid = false;
    }

    pub fn warn(&mut self, issue: ValidationIssue) {
        self.warnings.push(issue);
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score.clamp(0.0, 1.0));
        self
    }

    /// First error, used as the per-item skip cause.
    pub fn first_error(&self) -> Option<&ValidationIssue> {
        self.errors.first()
    }
}

/// A single validation rule.
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, item: &RawItem) -> ValidationResult;

    /// Reload read-only lookups. Called once at the start of every run.
    fn refresh_context(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// How the composite reacts to blocking errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Stop after the first validator that reports an error.
    #[default]
    Strict,
    /// Run every validator and report everything.
    Lenient,
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationMode::Strict => write!(f, "strict"),
            ValidationMode::Lenient => write!(f, "lenient"),
        }
    }
}

/// Ordered chain of validators.
pub struct CompositeValidator {
    validators: Vec<Box<dyn Validator>>,
    mode: ValidationMode,
}

impl CompositeValidator {
    pub fn new(validators: Vec<Box<dyn Validator>>, mode: ValidationMode) -> Self {
        Self { validators, mode }
    }

    /// A composite with no rules. Everything but malformed records passes.
    pub fn empty() -> Self {
        Self::new(Vec::new(), ValidationMode::Strict)
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn validate(&self, item: &RawItem) -> ValidationResult {
        self.validate_in(item, self.mode)
    }

    /// Validate under an explicit mode, overriding the configured one.
    pub fn validate_in(&self, item: &RawItem, mode: ValidationMode) -> ValidationResult {
        if let Some(cause) = &item.parse_error {
            return ValidationResult::fail(ValidationIssue::new(
                "malformed_record",
                format!("record could not be parsed: {cause}"),
            ));
        }

        let mut combined = ValidationResult::pass();
        let mut scores = Vec::new();
        for validator in &self.validators {
            let result = validator.validate(item);
            let blocked = !result.valid;
            combined.errors.extend(result.errors);
            combined.warnings.extend(result.warnings);
            if let Some(score) = result.score {
                scores.push(score);
            }
            if blocked && mode == ValidationMode::Strict {
                break;
            }
        }
        combined.valid = combined.errors.is_empty();
        if !scores.is_empty() {
            combined.score = Some(scores.iter().sum::<f64>() / scores.len() as f64);
        }
        combined
    }

    pub fn refresh_context(&self) -> Result<(), SourceError> {
        for validator in &self.validators {
            validator.refresh_context()?;
        }
        Ok(())
    }
}

/// Declarative validator selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidatorSpec {
    Schema {
        fields: BTreeMap<String, FieldSpec>,
        #[serde(default)]
        allow_extra: bool,
    },
    Completeness {
        #[serde(default)]
        required: Vec<String>,
        #[serde(default)]
        recommended: Vec<String>,
        /// Field name to regex that the field's string value must match.
        #[serde(default)]
        patterns: BTreeMap<String, String>,
    },
    ContentQuality {
        #[serde(default)]
        text_fields: Vec<String>,
        #[serde(default)]
        vocabulary: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vocabulary_file: Option<PathBuf>,
        #[serde(default = "default_quality_threshold")]
        threshold: f64,
        #[serde(default)]
        strict: bool,
        #[serde(default)]
        min_text_length: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_text_length: Option<usize>,
    },
    Referential {
        field: String,
        lookup: LookupSpec,
        #[serde(default)]
        allow_missing: bool,
    },
    Duplicate {
        field: String,
        lookup: LookupSpec,
        #[serde(default)]
        allow_overwrite: bool,
    },
}

fn default_quality_threshold() -> f64 {
    0.001
}

/// Build validators in declaration order. Relative paths resolve against `base_dir`.
pub fn build_validators(
    specs: &[ValidatorSpec],
    base_dir: &Path,
) -> Result<Vec<Box<dyn Validator>>, ConfigError> {
    specs
        .iter()
        .map(|spec| build_validator(spec, base_dir))
        .collect()
}

fn build_validator(
    spec: &ValidatorSpec,
    base_dir: &Path,
) -> Result<Box<dyn Validator>, ConfigError> {
    Ok(match spec {
        ValidatorSpec::Schema {
            fields,
            allow_extra,
        } => Box::new(SchemaValidator::new(fields.clone(), *allow_extra)),
        ValidatorSpec::Completeness {
            required,
            recommended,
            patterns,
        } => Box::new(CompletenessValidator::new(
            required.clone(),
            recommended.clone(),
            patterns,
        )?),
        ValidatorSpec::ContentQuality {
            text_fields,
            vocabulary,
            vocabulary_file,
            threshold,
            strict,
            min_text_length,
            max_text_length,
        } => {
            let mut validator = ContentQualityValidator::new(vocabulary.iter().cloned())
                .with_threshold(*threshold)
                .with_strict(*strict)
                .with_length_bounds(*min_text_length, *max_text_length);
            if !text_fields.is_empty() {
                validator = validator.with_text_fields(text_fields.clone());
            }
            if let Some(file) = vocabulary_file {
                validator =
                    validator.with_vocabulary_file(&crate::source::resolve_path(base_dir, file))?;
            }
            Box::new(validator)
        }
        ValidatorSpec::Referential {
            field,
            lookup,
            allow_missing,
        } => Box::new(ReferentialIntegrityValidator::new(
            field.clone(),
            lookup.build(base_dir)?,
            *allow_missing,
        )),
        ValidatorSpec::Duplicate {
            field,
            lookup,
            allow_overwrite,
        } => Box::new(DuplicateValidator::new(
            field.clone(),
            lookup.build(base_dir)?,
            *allow_overwrite,
        )),
    })
}

/// Render a scalar JSON value as a lookup key. Objects and arrays have no key.
pub(crate) fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
