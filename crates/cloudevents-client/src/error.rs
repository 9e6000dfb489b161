//! CloudEvents client errors

use thiserror::Error;

/// Errors that can occur when building or sending a CloudEvent.
///
/// Every error returned from a send means the event was not delivered.
#[derive(Debug, Error)]
pub enum CloudEventError {
    /// HTTP transport error (connection refused, timeout, TLS, ...)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The receiver answered with a non-2xx status
    #[error("Event rejected by receiver: {status} - {body}")]
    Rejected {
        /// HTTP status code returned by the receiver
        status: u16,
        /// Response body, possibly empty
        body: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The target address is not a valid absolute URL
    #[error("Invalid target address: {0}")]
    InvalidTarget(String),
}
