//! Receiver errors

use thiserror::Error;

/// Errors that can occur while receiving CloudEvents.
#[derive(Debug, Error)]
pub enum ReceiverError {
    /// A required context attribute header is absent
    #[error("Missing CloudEvent attribute: {0}")]
    MissingAttribute(&'static str),

    /// A context attribute is present but malformed
    #[error("Invalid CloudEvent attribute {name}: {reason}")]
    InvalidAttribute {
        /// Attribute header name
        name: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// The body could not be decoded
    #[error("Invalid event body: {0}")]
    Body(#[from] serde_json::Error),

    /// Listener or server IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bind address could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}
