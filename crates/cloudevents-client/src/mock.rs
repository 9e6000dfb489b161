//! Mock EventSender for unit testing
//!
//! Records every delivery attempt in memory and can be switched into a failing mode to
//! simulate an unreachable or rejecting receiver.

use crate::error::CloudEventError;
use crate::event::CloudEvent;
use crate::sender_trait::EventSender;
use parking_lot::Mutex;
use std::sync::Arc;

/// Mock EventSender for testing
///
/// Clones share the same recorded attempts, so a test can keep one handle while the code
/// under test owns another.
#[derive(Debug, Clone, Default)]
pub struct MockEventSender {
    attempts: Arc<Mutex<Vec<(String, CloudEvent)>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl MockEventSender {
    /// Create a mock that acknowledges every event
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following send fail with `reason`
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.lock() = Some(reason.into());
    }

    /// Make every following send succeed
    pub fn succeed(&self) {
        *self.failure.lock() = None;
    }

    /// All attempts so far as `(target, event)`, including failed ones
    pub fn attempts(&self) -> Vec<(String, CloudEvent)> {
        self.attempts.lock().clone()
    }

    /// Events from all attempts so far
    pub fn events(&self) -> Vec<CloudEvent> {
        self.attempts.lock().iter().map(|(_, event)| event.clone()).collect()
    }

    /// Number of attempts so far
    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Forget recorded attempts
    pub fn clear(&self) {
        self.attempts.lock().clear();
    }
}

#[async_trait::async_trait]
impl EventSender for MockEventSender {
    async fn send(&self, target: &str, event: &CloudEvent) -> Result<(), CloudEventError> {
        self.attempts.lock().push((target.to_string(), event.clone()));
        match self.failure.lock().clone() {
            Some(body) => Err(CloudEventError::Rejected { status: 503, body }),
            None => Ok(()),
        }
    }
}
