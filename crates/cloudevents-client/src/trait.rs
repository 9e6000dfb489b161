//! EventSender trait for mocking
//!
//! This trait abstracts event delivery so reconcilers can be unit tested without a receiver.
//! The concrete `HttpEventSender` implements it, and tests can use `MockEventSender`.

use crate::error::CloudEventError;
use crate::event::CloudEvent;

/// Delivers a single CloudEvent to a target address.
///
/// Each call is exactly one delivery attempt: no retry and no buffering. `Ok(())` means the
/// receiver acknowledged the event; any error means it was not delivered. Implementations must
/// be safe to call concurrently.
#[async_trait::async_trait]
pub trait EventSender: Send + Sync {
    /// Sends `event` to `target`.
    async fn send(&self, target: &str, event: &CloudEvent) -> Result<(), CloudEventError>;
}
