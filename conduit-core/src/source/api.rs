//! Network API source with offset/limit pagination.

use super::{DataSource, item_ref_for};
use crate::error::{ConfigError, SourceError};
use crate::types::{Cursor, FetchPage, RawItem};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Fetches pages via `GET {url}?offset={cursor}&limit={limit}`.
///
/// The body is either a JSON array of items or an object whose `items_field`
/// holds the array, optionally with `next_offset` (null when exhausted) or `has_more`.
pub struct ApiSource {
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
    items_field: String,
    id_field: Option<String>,
}

impl ApiSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ConfigError> {
        let url = url.into();
        reqwest::Url::parse(&url).map_err(|e| ConfigError::Invalid {
            message: format!("invalid source url '{url}': {e}"),
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent("Conduit/0.4")
            .build()
            .map_err(|e| ConfigError::Invalid {
                message: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            url,
            bearer_token: None,
            items_field: "items".to_string(),
            id_field: None,
        })
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }

    pub fn with_items_field(mut self, field: impl Into<String>) -> Self {
        self.items_field = field.into();
        self
    }

    pub fn with_id_field(mut self, id_field: Option<String>) -> Self {
        self.id_field = id_field;
        self
    }

    async fn get(&self, offset: u64, limit: usize) -> Result<reqwest::Response, SourceError> {
        let mut request = self
            .client
            .get(&self.url)
            .query(&[("offset", offset.to_string()), ("limit", limit.to_string())]);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| self.classify_transport(e))?;
        self.check_status(response.status())?;
        Ok(response)
    }

    fn classify_transport(&self, error: reqwest::Error) -> SourceError {
        if error.is_timeout() || error.is_connect() || error.is_request() {
            SourceError::Connection {
                source_id: self.identifier(),
                message: error.to_string(),
            }
        } else {
            SourceError::Protocol {
                source_id: self.identifier(),
                message: error.to_string(),
            }
        }
    }

    fn check_status(&self, status: StatusCode) -> Result<(), SourceError> {
        let source_id = self.identifier();
        let message = format!("HTTP {status}");
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(SourceError::Auth { source_id, message })
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(SourceError::Connection { source_id, message })
        } else {
            Err(SourceError::Protocol { source_id, message })
        }
    }

    fn parse_page(&self, body: Value, offset: u64, limit: usize) -> Result<FetchPage, SourceError> {
        let (values, next_offset, explicit_more) = match body {
            Value::Array(values) => (values, None, None),
            Value::Object(mut obj) => {
                let values = match obj.remove(&self.items_field) {
                    Some(Value::Array(values)) => values,
                    _ => {
                        return Err(SourceError::Protocol {
                            source_id: self.identifier(),
                            message: format!("response has no '{}' array", self.items_field),
                        });
                    }
                };
                let next = obj.get("next_offset").map(|v| v.as_u64());
                let more = obj.get("has_more").and_then(Value::as_bool);
                (values, next, more)
            }
            other => {
                return Err(SourceError::Protocol {
                    source_id: self.identifier(),
                    message: format!("unexpected response body: {other}"),
                });
            }
        };

        let count = values.len() as u64;
        let items: Vec<RawItem> = values
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                let fallback = format!("{}#{}", self.url, offset + i as u64);
                RawItem::new(
                    item_ref_for(&payload, self.id_field.as_deref(), fallback),
                    payload,
                )
            })
            .collect();

        // `next_offset: null` means exhausted; a number both advances and signals more.
        let (next, has_more) = match next_offset {
            Some(Some(next)) => (next, true),
            Some(None) => (offset + count, false),
            None => (
                offset + count,
                explicit_more.unwrap_or(count > 0 && count as usize >= limit),
            ),
        };
        Ok(FetchPage {
            items,
            next_cursor: Cursor::from_offset(next),
            has_more,
        })
    }
}

#[async_trait]
impl DataSource for ApiSource {
    fn identifier(&self) -> String {
        format!("api:{}", self.url)
    }

    async fn validate_connection(&self) -> Result<bool, SourceError> {
        match self.get(0, 1).await {
            Ok(_) => Ok(true),
            Err(SourceError::Protocol { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn fetch_batch(&self, cursor: &Cursor, limit: usize) -> Result<FetchPage, SourceError> {
        let offset = cursor.as_offset().ok_or_else(|| SourceError::InvalidCursor {
            source_id: self.identifier(),
            cursor: cursor.as_str().to_string(),
        })?;
        let response = self.get(offset, limit).await?;
        let body: Value = response.json().await.map_err(|e| SourceError::Protocol {
            source_id: self.identifier(),
            message: format!("invalid JSON body: {e}"),
        })?;
        let page = self.parse_page(body, offset, limit)?;
        debug!(
            source = %self.identifier(),
            offset,
            items = page.items.len(),
            has_more = page.has_more,
            "Fetched API page"
        );
        Ok(page)
    }
}
