//! Metadata completeness: required fields, recommended fields, and field patterns.

use super::{ValidationIssue, ValidationResult, Validator};
use crate::error::ConfigError;
use crate::types::RawItem;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

pub struct CompletenessValidator {
    required: Vec<String>,
    recommended: Vec<String>,
    patterns: Vec<(String, Regex)>,
}

impl CompletenessValidator {
    /// Patterns are anchored at the start of the value.
    pub fn new(
        required: Vec<String>,
        recommended: Vec<String>,
        patterns: &BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let patterns = patterns
            .iter()
            .map(|(field, pattern)| {
                Regex::new(&format!("^(?:{pattern})"))
                    .map(|re| (field.clone(), re))
                    .map_err(|e| ConfigError::Invalid {
                        message: format!("invalid pattern for field '{field}': {e}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            required,
            recommended,
            patterns,
        })
    }
}

/// Null, blank strings, and empty containers count as absent.
fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
        Some(_) => true,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Validator for CompletenessValidator {
    fn name(&self) -> &str {
        "completeness"
    }

    fn validate(&self, item: &RawItem) -> ValidationResult {
        let Some(object) = item.payload.as_object() else {
            return ValidationResult::fail(ValidationIssue::new(
                "unsupported_payload",
                "completeness checks need a JSON object",
            ));
        };

        let mut result = ValidationResult::pass();
        for field in &self.required {
            if !is_present(object.get(field)) {
                result.error(ValidationIssue::for_field(
                    "missing_required",
                    field,
                    format!("missing required field: {field}"),
                ));
            }
        }
        for field in &self.recommended {
            if !is_present(object.get(field)) {
                result.warn(ValidationIssue::for_field(
                    "missing_recommended",
                    field,
                    format!("missing recommended field: {field}"),
                ));
            }
        }
        for (field, pattern) in &self.patterns {
            let value = object.get(field);
            if !is_present(value) {
                continue;
            }
            if let Some(value) = value {
                if !pattern.is_match(&as_text(value)) {
                    result.error(ValidationIssue::for_field(
                        "pattern_mismatch",
                        field,
                        format!("value does not match pattern {}", pattern.as_str()),
                    ));
                }
            }
        }
        result
    }
}
