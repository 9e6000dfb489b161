//! CloudEvents HTTP sender
//!
//! Implements the HTTP protocol binding in binary content mode.

use crate::error::CloudEventError;
use crate::event::CloudEvent;
use crate::sender_trait::EventSender;
use chrono::SecondsFormat;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use std::time::Duration;
use tracing::debug;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// CloudEvents HTTP sender
///
/// Cheap to share: the underlying `reqwest::Client` pools connections and is safe to use from
/// many tasks at once.
#[derive(Debug, Clone)]
pub struct HttpEventSender {
    client: Client,
}

impl HttpEventSender {
    /// Create a sender with the default 30 second request timeout
    pub fn new() -> Result<Self, CloudEventError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a sender with a custom request timeout
    ///
    /// # Arguments
    /// * `timeout` - Upper bound for connect + request + response
    pub fn with_timeout(timeout: Duration) -> Result<Self, CloudEventError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// POST `event` to `target` in binary content mode.
    ///
    /// # Returns
    /// * `Ok(())` - The receiver answered with a 2xx status
    /// * `Err(CloudEventError)` - The event was not delivered
    pub async fn send_event(&self, target: &str, event: &CloudEvent) -> Result<(), CloudEventError> {
        let url = Url::parse(target)
            .map_err(|e| CloudEventError::InvalidTarget(format!("{target}: {e}")))?;
        let body = event.data_bytes()?;

        let mut request = self
            .client
            .post(url)
            .header("ce-specversion", event.specversion.as_str())
            .header("ce-id", event.id.as_str())
            .header("ce-source", event.source.as_str())
            .header("ce-type", event.event_type.as_str());
        if let Some(time) = event.time {
            request = request.header("ce-time", time.to_rfc3339_opts(SecondsFormat::AutoSi, true));
        }
        if let Some(content_type) = &event.datacontenttype {
            request = request.header(CONTENT_TYPE, content_type.as_str());
        }

        debug!("Sending event {} to {}", event.id, target);
        let response = request.body(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudEventError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!("Event {} accepted with status {}", event.id, status);
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventSender for HttpEventSender {
    async fn send(&self, target: &str, event: &CloudEvent) -> Result<(), CloudEventError> {
        self.send_event(target, event).await
    }
}
