//! CloudEvents Test Receiver
//!
//! Listens for CloudEvents over HTTP and logs every event it receives. Point dynowatch's
//! `--events-target-address` at it to see notifications during development.

use anyhow::Result;
use clap::Parser;
use event_receiver::{EventRecorder, parse_bind_address, receiver_router};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// How long in-flight requests get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "test-receiver", about = "Logs CloudEvents received over HTTP")]
struct Args {
    /// The address to listen to.
    #[arg(long, default_value = ":8080")]
    address: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let addr = parse_bind_address(&args.address)?;

    let listener = TcpListener::bind(addr).await?;
    let router = receiver_router(Arc::new(EventRecorder::new()));

    info!(address = %addr, "running cloudEvent receiver");
    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = signal_rx.await;
            })
            .await
    });
    info!("cloudEvent receiver started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = signal_tx.send(());

    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(Ok(Ok(()))) => info!("shutdown complete"),
        Ok(Ok(Err(e))) => error!("error running HTTP receiver: {}", e),
        Ok(Err(e)) => error!("receiver task failed: {}", e),
        Err(_) => error!("failed to shut down receiver within {:?}", SHUTDOWN_GRACE),
    }

    Ok(())
}
