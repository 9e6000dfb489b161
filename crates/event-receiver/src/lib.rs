//! CloudEvents Test Receiver
//!
//! An HTTP endpoint that accepts CloudEvents, logs them and optionally records them in memory.
//!
//! This crate provides:
//! - `decode`: CloudEvent decoding for binary and structured content modes
//! - `recorder`: a toggleable in-memory event recorder
//! - `server`: the axum router and a `TestReceiver` bound to an ephemeral loopback port
//!
//! The `test-receiver` binary serves the same router on a fixed address.

pub mod decode;
pub mod error;
pub mod recorder;
pub mod server;

pub use decode::decode_event;
pub use error::ReceiverError;
pub use recorder::EventRecorder;
pub use server::{TestReceiver, parse_bind_address, receiver_router};
