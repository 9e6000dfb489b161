//! HTTP server for receiving CloudEvents.

use crate::decode::decode_event;
use crate::error::ReceiverError;
use crate::recorder::EventRecorder;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use cloudevents_client::CloudEvent;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Builds the receiver router. Events are accepted on any path.
pub fn receiver_router(recorder: Arc<EventRecorder>) -> Router {
    Router::new()
        .route("/", post(receive_event))
        .route("/{*path}", post(receive_event))
        .with_state(recorder)
        .layer(TraceLayer::new_for_http())
}

async fn receive_event(
    State(recorder): State<Arc<EventRecorder>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    match decode_event(&headers, &body) {
        Ok(event) => {
            info!(
                id = %event.id,
                source = %event.source,
                event_type = %event.event_type,
                data = %event.data.as_ref().map(ToString::to_string).unwrap_or_default(),
                "received event"
            );
            recorder.record(event);
            StatusCode::OK
        }
        Err(e) => {
            warn!("Rejected malformed event: {}", e);
            StatusCode::BAD_REQUEST
        }
    }
}

/// Parses a bind address, accepting the `:port` shorthand for all interfaces.
///
/// The receiver takes the same address forms as the controller flags but does not depend on
/// the controller crate.
pub fn parse_bind_address(address: &str) -> Result<SocketAddr, ReceiverError> {
    let full = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };
    full.parse()
        .map_err(|e| ReceiverError::InvalidAddress(format!("{address}: {e}")))
}

/// A receiver bound to an ephemeral loopback port, for tests.
#[derive(Debug)]
pub struct TestReceiver {
    addr: SocketAddr,
    recorder: Arc<EventRecorder>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<Result<(), std::io::Error>>,
}

impl TestReceiver {
    /// Binds `127.0.0.1:0` and starts serving in the background.
    pub async fn start() -> Result<Self, ReceiverError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let recorder = Arc::new(EventRecorder::new());
        let router = receiver_router(Arc::clone(&recorder));
        let (shutdown, signal) = oneshot::channel::<()>();

        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    // A dropped sender also means shut down
                    let _ = signal.await;
                })
                .await
        });

        Ok(Self {
            addr,
            recorder,
            shutdown: Some(shutdown),
            server,
        })
    }

    /// The bound socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL to use as an event target.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Starts recording events.
    pub fn start_recorder(&self) {
        self.recorder.start();
    }

    /// Stops recording events.
    pub fn stop_recorder(&self) {
        self.recorder.stop();
    }

    /// Drops recorded events.
    pub fn clear_events(&self) {
        self.recorder.clear();
    }

    /// Recorded events in arrival order.
    pub fn events(&self) -> Vec<CloudEvent> {
        self.recorder.events()
    }

    /// Stops the server and waits for it to exit.
    pub async fn shutdown(mut self) -> Result<(), ReceiverError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match (&mut self.server).await {
            Ok(result) => Ok(result?),
            Err(e) => Err(ReceiverError::Io(std::io::Error::other(e))),
        }
    }
}
