//! Duplicate detection against keys that already exist downstream.

use super::{ExistenceCheck, ValidationIssue, ValidationResult, Validator, key_of};
use crate::error::SourceError;
use crate::types::RawItem;
use std::sync::Arc;

/// Items without a key are not this validator's concern and pass.
pub struct DuplicateValidator {
    field: String,
    lookup: Arc<dyn ExistenceCheck>,
    allow_overwrite: bool,
}

impl DuplicateValidator {
    pub fn new(
        field: impl Into<String>,
        lookup: Arc<dyn ExistenceCheck>,
        allow_overwrite: bool,
    ) -> Self {
        Self {
            field: field.into(),
            lookup,
            allow_overwrite,
        }
    }
}

impl Validator for DuplicateValidator {
    fn name(&self) -> &str {
        "duplicate"
    }

    fn validate(&self, item: &RawItem) -> ValidationResult {
        let Some(key) = item.payload.get(&self.field).and_then(key_of) else {
            return ValidationResult::pass();
        };
        if !self.lookup.exists(&key) {
            return ValidationResult::pass();
        }
        let issue = ValidationIssue::for_field(
            "duplicate",
            &self.field,
            format!("key '{key}' already exists"),
        );
        let mut result = ValidationResult::pass();
        if self.allow_overwrite {
            result.warn(issue);
        } else {
            result.error(issue);
        }
        result
    }

    fn refresh_context(&self) -> Result<(), SourceError> {
        self.lookup.refresh()
    }
}
