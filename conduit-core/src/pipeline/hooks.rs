//! Process hooks: turning a validated raw item into a record ready to store.
//!
//! Document-style pipelines compose a [`ContentExtractor`] with an optional
//! [`Annotator`]. Extraction parse failures are soft skips; annotation failures
//! never cost the item, the record is stored without annotations and carries a warning.

use crate::error::{AnnotateError, ExtractError, ProcessError, StoreError};
use crate::types::{ProcessedRecord, RawItem};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Transforms a valid item into a record. `Ok(None)` skips the item.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process_item(&self, item: &RawItem) -> Result<Option<ProcessedRecord>, ProcessError>;
}

/// Persists a processed record.
#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn store_item(&self, record: &ProcessedRecord) -> Result<(), StoreError>;
}

/// Text plus metadata pulled out of a raw item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub item_ref: String,
    pub text: String,
    pub metadata: Value,
}

#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, item: &RawItem) -> Result<ExtractedContent, ExtractError>;
}

#[async_trait]
pub trait Annotator: Send + Sync {
    async fn annotate(&self, content: &ExtractedContent) -> Result<Value, AnnotateError>;
}

/// Declarative processor selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorSpec {
    /// Store the payload as-is, optionally keeping only some fields.
    Passthrough {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<Vec<String>>,
    },
    /// Extract text from the first non-empty text field and tag keywords.
    Document {
        #[serde(default = "default_text_fields")]
        text_fields: Vec<String>,
        /// Label to the terms that mark it. Empty means no annotation.
        #[serde(default)]
        keywords: BTreeMap<String, Vec<String>>,
    },
}

fn default_text_fields() -> Vec<String> {
    vec!["text".into(), "content".into(), "abstract".into(), "body".into()]
}

impl Default for ProcessorSpec {
    fn default() -> Self {
        ProcessorSpec::Passthrough { fields: None }
    }
}

pub fn build_processor(spec: &ProcessorSpec) -> Arc<dyn ItemProcessor> {
    match spec {
        ProcessorSpec::Passthrough { fields } => {
            Arc::new(PassthroughProcessor::new(fields.clone()))
        }
        ProcessorSpec::Document {
            text_fields,
            keywords,
        } => {
            let extractor = Arc::new(TextFieldExtractor::new(text_fields.clone()));
            let annotator: Option<Arc<dyn Annotator>> = if keywords.is_empty() {
                None
            } else {
                Some(Arc::new(KeywordAnnotator::new(keywords.clone())))
            };
            Arc::new(DocumentProcessor::new(extractor, annotator))
        }
    }
}

/// Stores the payload unchanged, or a projection of it.
pub struct PassthroughProcessor {
    fields: Option<Vec<String>>,
}

impl PassthroughProcessor {
    pub fn new(fields: Option<Vec<String>>) -> Self {
        Self { fields }
    }
}

#[async_trait]
impl ItemProcessor for PassthroughProcessor {
    async fn process_item(&self, item: &RawItem) -> Result<Option<ProcessedRecord>, ProcessError> {
        let data = match (&self.fields, &item.payload) {
            (Some(fields), Value::Object(object)) => Value::Object(
                fields
                    .iter()
                    .filter_map(|f| object.get(f).map(|v| (f.clone(), v.clone())))
                    .collect(),
            ),
            (Some(_), _) => {
                return Err(ProcessError {
                    item_ref: item.item_ref.clone(),
                    message: "field projection needs an object payload".into(),
                });
            }
            (None, payload) => payload.clone(),
        };
        Ok(Some(ProcessedRecord::new(item.item_ref.clone(), data)))
    }
}

/// Extractor, then optional annotator.
pub struct DocumentProcessor {
    extractor: Arc<dyn ContentExtractor>,
    annotator: Option<Arc<dyn Annotator>>,
}

impl DocumentProcessor {
    pub fn new(
        extractor: Arc<dyn ContentExtractor>,
        annotator: Option<Arc<dyn Annotator>>,
    ) -> Self {
        Self {
            extractor,
            annotator,
        }
    }
}

#[async_trait]
impl ItemProcessor for DocumentProcessor {
    async fn process_item(&self, item: &RawItem) -> Result<Option<ProcessedRecord>, ProcessError> {
        let content = match self.extractor.extract(item).await {
            Ok(content) => content,
            Err(ExtractError::Parse(reason)) => {
                warn!(item_ref = %item.item_ref, reason = %reason, "Skipping unparseable document");
                return Ok(None);
            }
            Err(e) => {
                return Err(ProcessError {
                    item_ref: item.item_ref.clone(),
                    message: e.to_string(),
                });
            }
        };

        let mut record = ProcessedRecord::new(
            content.item_ref.clone(),
            json!({
                "text": content.text,
                "metadata": content.metadata,
            }),
        );
        if let Some(annotator) = &self.annotator {
            match annotator.annotate(&content).await {
                Ok(annotations) => record.annotations = Some(annotations),
                Err(e) => {
                    warn!(item_ref = %item.item_ref, error = %e, "Annotation failed");
                    record.warnings.push(e.to_string());
                }
            }
        }
        Ok(Some(record))
    }
}

/// Takes the first non-empty string among `text_fields`; everything else becomes metadata.
pub struct TextFieldExtractor {
    text_fields: Vec<String>,
}

impl TextFieldExtractor {
    pub fn new(text_fields: Vec<String>) -> Self {
        Self { text_fields }
    }
}

#[async_trait]
impl ContentExtractor for TextFieldExtractor {
    async fn extract(&self, item: &RawItem) -> Result<ExtractedContent, ExtractError> {
        let Some(object) = item.payload.as_object() else {
            return match &item.payload {
                Value::String(text) if !text.trim().is_empty() => Ok(ExtractedContent {
                    item_ref: item.item_ref.clone(),
                    text: text.clone(),
                    metadata: Value::Object(Map::new()),
                }),
                _ => Err(ExtractError::Parse("payload has no text".into())),
            };
        };

        let found = self.text_fields.iter().find_map(|field| match object.get(field) {
            Some(Value::String(text)) if !text.trim().is_empty() => Some((field, text.clone())),
            _ => None,
        });
        let Some((field, text)) = found else {
            return Err(ExtractError::Parse(format!(
                "none of {:?} holds text",
                self.text_fields
            )));
        };

        let metadata: Map<String, Value> = object
            .iter()
            .filter(|(k, _)| *k != field)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(ExtractedContent {
            item_ref: item.item_ref.clone(),
            text,
            metadata: Value::Object(metadata),
        })
    }
}

/// Tags text with every label whose terms appear in it (case-insensitive, whole words).
pub struct KeywordAnnotator {
    keywords: BTreeMap<String, Vec<String>>,
}

impl KeywordAnnotator {
    pub fn new(keywords: BTreeMap<String, Vec<String>>) -> Self {
        let keywords = keywords
            .into_iter()
            .map(|(label, terms)| (label, terms.into_iter().map(|t| t.to_lowercase()).collect()))
            .collect();
        Self { keywords }
    }
}

#[async_trait]
impl Annotator for KeywordAnnotator {
    async fn annotate(&self, content: &ExtractedContent) -> Result<Value, AnnotateError> {
        let words: std::collections::HashSet<String> = content
            .text
            .split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        let mut labels = Map::new();
        for (label, terms) in &self.keywords {
            let matched: Vec<Value> = terms
                .iter()
                .filter(|t| words.contains(t.as_str()))
                .map(|t| Value::String(t.clone()))
                .collect();
            if !matched.is_empty() {
                labels.insert(label.clone(), Value::Array(matched));
            }
        }
        Ok(json!({ "labels": labels }))
    }
}
