//! In-memory event recording.

use cloudevents_client::CloudEvent;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Records received events while recording is switched on.
///
/// Recording starts switched off, so events received before `start` are only logged.
#[derive(Debug, Default)]
pub struct EventRecorder {
    recording: AtomicBool,
    events: Mutex<Vec<CloudEvent>>,
}

impl EventRecorder {
    /// Creates a recorder that is not yet recording.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts recording.
    pub fn start(&self) {
        self.recording.store(true, Ordering::SeqCst);
    }

    /// Stops recording. Already recorded events are kept.
    pub fn stop(&self) {
        self.recording.store(false, Ordering::SeqCst);
    }

    /// Whether events are currently being recorded.
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Stores `event` if recording is on.
    pub fn record(&self, event: CloudEvent) {
        if !self.is_recording() {
            return;
        }
        self.events.lock().push(event);
    }

    /// A copy of the recorded events in arrival order.
    pub fn events(&self) -> Vec<CloudEvent> {
        self.events.lock().clone()
    }

    /// Drops all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}
