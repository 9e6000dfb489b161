//! CloudEvents 1.0 event model
//!
//! Only the attributes dynowatch produces are modelled: the required context attributes plus
//! `time`, `datacontenttype` and JSON `data`. The serde representation is the structured JSON
//! format (`application/cloudevents+json`).

use crate::error::CloudEventError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The CloudEvents specification version emitted by this crate.
pub const SPEC_VERSION: &str = "1.0";

/// Content type of JSON event data.
pub const APPLICATION_JSON: &str = "application/json";

/// Content type of a structured-mode CloudEvent.
pub const CLOUDEVENTS_JSON: &str = "application/cloudevents+json";

/// A CloudEvent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    /// Specification version, always `1.0` for events built here
    pub specversion: String,
    /// Event identifier, unique per source
    pub id: String,
    /// URI reference identifying the context the event happened in
    pub source: String,
    /// Event type
    #[serde(rename = "type")]
    pub event_type: String,
    /// Time the event was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Content type of `data`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    /// Event payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CloudEvent {
    /// Creates an event with a random UUID v4 id and the current time.
    pub fn new(source: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            specversion: SPEC_VERSION.to_string(),
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: event_type.into(),
            time: Some(Utc::now()),
            datacontenttype: None,
            data: None,
        }
    }

    /// Sets `data` to the JSON encoding of `data` and the content type to `application/json`.
    pub fn with_json_data<T: Serialize>(mut self, data: &T) -> Result<Self, CloudEventError> {
        self.data = Some(serde_json::to_value(data)?);
        self.datacontenttype = Some(APPLICATION_JSON.to_string());
        Ok(self)
    }

    /// Decodes `data` into `T`. Returns `Ok(None)` when the event carries no data.
    pub fn json_data<T: DeserializeOwned>(&self) -> Result<Option<T>, CloudEventError> {
        self.data
            .as_ref()
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(CloudEventError::from)
    }

    /// Encodes `data` as the HTTP body for binary content mode.
    ///
    /// String data is written as-is so text payloads survive a round trip; everything else is
    /// JSON encoded.
    pub fn data_bytes(&self) -> Result<Vec<u8>, CloudEventError> {
        match &self.data {
            None => Ok(Vec::new()),
            Some(serde_json::Value::String(text))
                if !self.datacontenttype.as_deref().is_some_and(is_json_content_type) =>
            {
                Ok(text.clone().into_bytes())
            }
            Some(value) => Ok(serde_json::to_vec(value)?),
        }
    }
}

/// Returns true for `application/json` and `+json` media types, ignoring parameters.
pub fn is_json_content_type(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    media_type == APPLICATION_JSON || media_type.ends_with("+json")
}
