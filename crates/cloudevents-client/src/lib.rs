//! CloudEvents HTTP Client
//!
//! A small client library for emitting [CloudEvents 1.0](https://cloudevents.io) over HTTP.
//! Events are sent in binary content mode: context attributes travel as `ce-*` headers and
//! the event data is the request body.
//!
//! # Example
//!
//! ```no_run
//! use cloudevents_client::{CloudEvent, EventSender, HttpEventSender};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sender = HttpEventSender::new()?;
//!
//! let event = CloudEvent::new("localhost", "dynowatch.kubearchive.dev")
//!     .with_json_data(&serde_json::json!({"kind": "Job", "name": "pi"}))?;
//!
//! sender.send("http://localhost:8082", &event).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Binary content mode**: the encoding the receiver side of dynowatch expects
//! - **Shared connection pool**: one `HttpEventSender` is safe to use from many tasks
//! - **`test-util`**: exposes `MockEventSender`, an in-memory recording sender

pub mod client;
pub mod error;
pub mod event;
#[path = "trait.rs"]
pub mod sender_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::HttpEventSender;
pub use error::CloudEventError;
pub use event::{APPLICATION_JSON, CLOUDEVENTS_JSON, CloudEvent, SPEC_VERSION};
pub use sender_trait::EventSender;
#[cfg(feature = "test-util")]
pub use mock::MockEventSender;
