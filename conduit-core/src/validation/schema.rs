//! Structural validation: declared fields, JSON types, and undeclared fields.

use super::{ValidationIssue, ValidationResult, Validator};
use crate::types::RawItem;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// JSON type a field must have.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl FieldType {
    /// `null` only matches `Any`; nullable optional fields should be omitted instead.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Any => "any",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    pub fn required(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
        }
    }

    pub fn optional(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
        }
    }
}

pub struct SchemaValidator {
    fields: BTreeMap<String, FieldSpec>,
    allow_extra: bool,
}

impl SchemaValidator {
    pub fn new(fields: BTreeMap<String, FieldSpec>, allow_extra: bool) -> Self {
        Self {
            fields,
            allow_extra,
        }
    }
}

impl Validator for SchemaValidator {
    fn name(&self) -> &str {
        "schema"
    }

    fn validate(&self, item: &RawItem) -> ValidationResult {
        if let Some(cause) = &item.parse_error {
            return ValidationResult::fail(ValidationIssue::new(
                "malformed_record",
                format!("record could not be parsed: {cause}"),
            ));
        }
        let Some(object) = item.payload.as_object() else {
            return ValidationResult::fail(ValidationIssue::new(
                "not_an_object",
                "payload must be a JSON object",
            ));
        };

        let mut result = ValidationResult::pass();
        for (name, spec) in &self.fields {
            match object.get(name) {
                None | Some(Value::Null) if spec.required => result.error(
                    ValidationIssue::for_field("missing_field", name, "required field is missing"),
                ),
                None | Some(Value::Null) => {}
                Some(value) if !spec.field_type.matches(value) => {
                    result.error(ValidationIssue::for_field(
                        "wrong_type",
                        name,
                        format!("expected {}", spec.field_type),
                    ))
                }
                Some(_) => {}
            }
        }

        if !self.allow_extra {
            for name in object.keys().filter(|k| !self.fields.contains_key(*k)) {
                result.error(ValidationIssue::for_field(
                    "unexpected_field",
                    name,
                    "field is not declared in the schema",
                ));
            }
        }
        result
    }
}
