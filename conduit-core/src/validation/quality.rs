//! Content quality: text presence, length bounds, encoding, and vocabulary relevance.

use super::{ValidationIssue, ValidationResult, Validator};
use crate::error::ConfigError;
use crate::types::RawItem;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

const DEFAULT_TEXT_FIELDS: &[&str] = &["text", "content", "abstract", "body", "title"];

/// Share of non-ASCII characters above which text is flagged as possibly non-English.
const NON_ASCII_RATIO: f64 = 0.10;

/// Scores text by the fraction of its words found in a domain vocabulary.
///
/// The score is only reported when a vocabulary is configured.
pub struct ContentQualityValidator {
    text_fields: Vec<String>,
    vocabulary: HashSet<String>,
    threshold: f64,
    strict: bool,
    min_text_length: usize,
    max_text_length: Option<usize>,
}

impl ContentQualityValidator {
    pub fn new<I, S>(vocabulary: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            text_fields: DEFAULT_TEXT_FIELDS.iter().map(|f| f.to_string()).collect(),
            vocabulary: vocabulary
                .into_iter()
                .map(|w| w.as_ref().trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
            threshold: 0.001,
            strict: false,
            min_text_length: 0,
            max_text_length: None,
        }
    }

    pub fn with_text_fields(mut self, fields: Vec<String>) -> Self {
        self.text_fields = fields;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Low relevance becomes a blocking error instead of a warning.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_length_bounds(mut self, min: usize, max: Option<usize>) -> Self {
        self.min_text_length = min;
        self.max_text_length = max;
        self
    }

    /// Add terms from a file with one term per line. Blank lines and `#` comments are ignored.
    pub fn with_vocabulary_file(mut self, path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
            message: format!("cannot read vocabulary file {}: {e}", path.display()),
        })?;
        self.vocabulary.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_lowercase),
        );
        Ok(self)
    }

    pub fn vocabulary_len(&self) -> usize {
        self.vocabulary.len()
    }

    fn extract_text(&self, payload: &Value) -> Option<String> {
        if let Value::String(s) = payload {
            return (!s.trim().is_empty()).then(|| s.clone());
        }
        let object = payload.as_object()?;
        self.text_fields.iter().find_map(|field| match object.get(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
            Some(Value::Null) | Some(Value::String(_)) | None => None,
            Some(other) => Some(other.to_string()),
        })
    }

    /// Fraction of words that appear in the vocabulary.
    pub fn relevance(&self, text: &str) -> f64 {
        let mut total = 0usize;
        let mut hits = 0usize;
        for word in text
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|w| !w.is_empty())
        {
            total += 1;
            if self.vocabulary.contains(&word.to_lowercase()) {
                hits += 1;
            }
        }
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl Validator for ContentQualityValidator {
    fn name(&self) -> &str {
        "content_quality"
    }

    fn validate(&self, item: &RawItem) -> ValidationResult {
        let Some(text) = self.extract_text(&item.payload) else {
            return ValidationResult::fail(ValidationIssue::new(
                "missing_text",
                "no text content found",
            ));
        };

        let mut result = ValidationResult::pass();
        let trimmed = text.trim();
        let length = trimmed.chars().count();
        if length < self.min_text_length {
            result.error(ValidationIssue::new(
                "text_too_short",
                format!("text too short: {length} < {} characters", self.min_text_length),
            ));
        } else if let Some(max) = self.max_text_length.filter(|max| length > *max) {
            result.warn(ValidationIssue::new(
                "text_too_long",
                format!("text very long: {length} > {max} characters"),
            ));
        }

        let total_chars = text.chars().count();
        let non_ascii = text.chars().filter(|c| !c.is_ascii()).count();
        if total_chars > 0 && non_ascii as f64 > total_chars as f64 * NON_ASCII_RATIO {
            result.warn(ValidationIssue::new(
                "non_english_text",
                format!("possible non-English content ({non_ascii} non-ASCII characters)"),
            ));
        }

        if self.vocabulary.is_empty() {
            return result;
        }
        let score = self.relevance(&text);
        if score < self.threshold {
            let issue = ValidationIssue::new(
                "low_relevance",
                format!("relevance score {score:.4} below {}", self.threshold),
            );
            if self.strict {
                result.error(issue);
            } else {
                result.warn(issue);
            }
        }
        result.with_score(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> ContentQualityValidator {
        ContentQualityValidator::new(["protein", "gene", "tumor"])
    }

    #[test]
    fn test_relevance_score() {
        let v = validator();
        assert!((v.relevance("The protein binds the gene") - 0.4).abs() < 1e-9);
        assert_eq!(v.relevance("!!!"), 0.0);
        assert!((v.relevance("PROTEIN") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_reports_score() {
        let item = RawItem::new("1", json!({"abstract": "tumor growth and gene expression"}));
        let result = validator().validate(&item);
        assert!(result.valid);
        assert!((result.score.unwrap() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_first_non_empty_field_is_used() {
        let item = RawItem::new("1", json!({"text": "", "abstract": "gene"}));
        let result = validator().validate(&item);
        assert_eq!(result.score, Some(1.0));
    }

    #[test]
    fn test_missing_text_is_error() {
        let item = RawItem::new("1", json!({"id": 3}));
        let result = validator().validate(&item);
        assert!(!result.valid);
        assert_eq!(result.errors[0].code, "missing_text");
    }

    #[test]
    fn test_low_relevance_warning_or_error() {
        let item = RawItem::new("1", json!({"text": "completely unrelated words here"}));
        let lenient = validator().with_threshold(0.1).validate(&item);
        assert!(lenient.valid);
        assert_eq!(lenient.warnings[0].code, "low_relevance");

        let strict = validator()
            .with_threshold(0.1)
            .with_strict(true)
            .validate(&item);
        assert!(!strict.valid);
        assert_eq!(strict.errors[0].code, "low_relevance");
    }

    #[test]
    fn test_length_bounds() {
        let v = validator().with_length_bounds(10, Some(20));
        let short = v.validate(&RawItem::new("1", json!({"text": "gene"})));
        assert_eq!(short.errors[0].code, "text_too_short");

        let long = v.validate(&RawItem::new(
            "2",
            json!({"text": "gene gene gene gene gene gene"}),
        ));
        assert!(long.valid);
        assert_eq!(long.warnings[0].code, "text_too_long");
    }

    #[test]
    fn test_non_english_warning() {
        let item = RawItem::new("1", json!({"text": "蛋白质 gene 基因"}));
        let result = validator().validate(&item);
        assert!(result.warnings.iter().any(|w| w.code == "non_english_text"));
    }

    #[test]
    fn test_no_vocabulary_means_no_score() {
        let v = ContentQualityValidator::new(Vec::<String>::new());
        let result = v.validate(&RawItem::new("1", json!("plain string payload")));
        assert!(result.valid);
        assert_eq!(result.score, None);
    }

    #[test]
    fn test_vocabulary_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vocab.txt");
        std::fs::write(&path, "# terms\nBiopsy\n\nlymphoma\n").unwrap();
        let v = ContentQualityValidator::new(["gene"])
            .with_vocabulary_file(&path)
            .unwrap();
        assert_eq!(v.vocabulary_len(), 3);
        assert!((v.relevance("biopsy lymphoma") - 1.0).abs() < 1e-9);
    }
}
