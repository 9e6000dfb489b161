//! Controller-specific error types.
//!
//! This module defines the errors of the dynowatch controller. Every error a reconcile
//! invocation returns is retryable: the watch engine logs it and requeues the object.

use cloudevents_client::CloudEventError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the dynowatch controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Fetching object state failed for a reason other than absence
    #[error("Failed to fetch object: {0}")]
    Fetch(String),

    /// The notification did not reach the receiver
    #[error("Event not delivered: {0}")]
    Undelivered(#[source] CloudEventError),

    /// The event sender could not be created
    #[error("Failed to create event sender: {0}")]
    Sender(#[source] CloudEventError),

    /// The notification envelope could not be built
    #[error("Failed to build event: {0}")]
    Envelope(#[source] CloudEventError),

    /// The invocation was canceled or ran past its deadline
    #[error("Reconciliation canceled: {0}")]
    Canceled(String),

    /// A watch could not be registered with the engine
    #[error("Registration failed: {0}")]
    Registration(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be read or parsed
    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    /// Probe or metrics server error
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// The leader lease could not be written or was lost
    #[error("Leader election failed: {0}")]
    LeaderElection(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
