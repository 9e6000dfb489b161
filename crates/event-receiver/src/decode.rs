//! CloudEvent decoding for the HTTP protocol binding.
//!
//! Structured mode is recognised by a `application/cloudevents+json` content type; anything
//! else is treated as binary mode with `ce-*` attribute headers.

use crate::error::ReceiverError;
use axum::http::HeaderMap;
use axum::http::header::CONTENT_TYPE;
use chrono::{DateTime, Utc};
use cloudevents_client::event::is_json_content_type;
use cloudevents_client::{CLOUDEVENTS_JSON, CloudEvent};

/// Decodes a CloudEvent from request headers and body.
pub fn decode_event(headers: &HeaderMap, body: &[u8]) -> Result<CloudEvent, ReceiverError> {
    let content_type = optional_header(headers, CONTENT_TYPE.as_str())?;

    if content_type
        .as_deref()
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with(CLOUDEVENTS_JSON))
    {
        return Ok(serde_json::from_slice(body)?);
    }

    let time = optional_header(headers, "ce-time")?
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| ReceiverError::InvalidAttribute {
                    name: "ce-time",
                    reason: e.to_string(),
                })
        })
        .transpose()?;

    let data = if body.is_empty() {
        None
    } else if content_type.as_deref().is_some_and(is_json_content_type) {
        Some(serde_json::from_slice(body)?)
    } else {
        Some(serde_json::Value::String(String::from_utf8_lossy(body).into_owned()))
    };

    Ok(CloudEvent {
        specversion: required_header(headers, "ce-specversion")?,
        id: required_header(headers, "ce-id")?,
        source: required_header(headers, "ce-source")?,
        event_type: required_header(headers, "ce-type")?,
        time,
        datacontenttype: content_type,
        data,
    })
}

fn required_header(headers: &HeaderMap, name: &'static str) -> Result<String, ReceiverError> {
    optional_header(headers, name)?.ok_or(ReceiverError::MissingAttribute(name))
}

fn optional_header(headers: &HeaderMap, name: &'static str) -> Result<Option<String>, ReceiverError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::to_string)
                .map_err(|e| ReceiverError::InvalidAttribute {
                    name,
                    reason: e.to_string(),
                })
        })
        .transpose()
}
