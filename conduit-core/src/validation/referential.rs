//! Referential integrity: a foreign-key field must point at an existing key.

use super::{ExistenceCheck, ValidationIssue, ValidationResult, Validator, key_of};
use crate::error::SourceError;
use crate::types::RawItem;
use std::sync::Arc;

pub struct ReferentialIntegrityValidator {
    field: String,
    lookup: Arc<dyn ExistenceCheck>,
    allow_missing: bool,
}

impl ReferentialIntegrityValidator {
    pub fn new(
        field: impl Into<String>,
        lookup: Arc<dyn ExistenceCheck>,
        allow_missing: bool,
    ) -> Self {
        Self {
            field: field.into(),
            lookup,
            allow_missing,
        }
    }
}

impl Validator for ReferentialIntegrityValidator {
    fn name(&self) -> &str {
        "referential"
    }

    fn validate(&self, item: &RawItem) -> ValidationResult {
        let key = item.payload.get(&self.field).and_then(key_of);
        match key {
            None if self.allow_missing => ValidationResult::pass(),
            None => ValidationResult::fail(ValidationIssue::for_field(
                "missing_reference",
                &self.field,
                format!("foreign key field '{}' is missing or empty", self.field),
            )),
            Some(key) if self.lookup.exists(&key) => ValidationResult::pass(),
            Some(key) => ValidationResult::fail(ValidationIssue::for_field(
                "dangling_reference",
                &self.field,
                format!("referenced key '{key}' does not exist"),
            )),
        }
    }

    fn refresh_context(&self) -> Result<(), SourceError> {
        self.lookup.refresh()
    }
}
