//! dynowatch Controller
//!
//! Watches the configured Kubernetes resource kinds and emits a CloudEvent for every create,
//! update and delete of an object of a watched kind. The event identifies the object
//! (kind, apiVersion, namespace, name); receivers fetch state themselves.
//!
//! Undelivered events are retried with a Fibonacci backoff until delivery succeeds.
//! With `--leader-elect` only the replica holding the leader lease runs the watches.

mod backoff;
mod config;
mod controller;
mod engine;
mod envelope;
mod error;
mod health;
mod leader;
mod metrics;
mod queue;
mod reconciler;
#[cfg(test)]
mod test_utils;
mod watcher;

use clap::Parser;
use cloudevents_client::HttpEventSender;
use crate::config::{Args, DynowatchConfig, parse_bind_address};
use controller::Controller;
use error::ControllerError;
use health::ProbeState;
use kube::Client;
use leader::{KubeLeaseStore, LeaderElector};
use metrics::Metrics;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use watcher::KubeWatchEngine;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting dynowatch Controller");

    let args = Args::parse();
    let config = DynowatchConfig::load(&args)?;

    info!("Configuration:");
    info!("  Metrics address: {}", config.metrics.bind_address);
    info!("  Probe address: {}", config.healthz.bind_address);
    info!("  Event source: {}", config.cloud_events.source_uri);
    info!("  Event target: {}", config.cloud_events.target_address);
    info!(
        "  Namespace: {}",
        config.watch_namespace.as_deref().unwrap_or("all namespaces")
    );
    info!("  Watches: {}", config.watches.len());
    info!("  Leader election: {}", config.leader_election.enabled);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!("Unable to listen for shutdown signal: {}", e),
            }
            shutdown.cancel();
        });
    }

    let metrics = Metrics::new()?;
    let probes = Arc::new(ProbeState::new());

    let probe_listener = health::bind(parse_bind_address(&config.healthz.bind_address)?).await?;
    let metrics_listener = health::bind(parse_bind_address(&config.metrics.bind_address)?).await?;
    let probe_server = tokio::spawn(health::serve(
        probe_listener,
        health::probe_router(Arc::clone(&probes)),
        shutdown.clone(),
    ));
    let metrics_server = tokio::spawn(health::serve(
        metrics_listener,
        health::metrics_router(metrics.clone()),
        shutdown.clone(),
    ));

    let client = Client::try_default().await?;
    let result = run(&config, client, metrics, &probes, shutdown.clone()).await;
    probes.set_ready(false);
    shutdown.cancel();

    for (endpoint, server) in [("probe", probe_server), ("metrics", metrics_server)] {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} endpoint error: {}", endpoint, e),
            Err(e) => error!("{} endpoint panicked: {}", endpoint, e),
        }
    }

    result?;
    info!("Shutdown complete");
    Ok(())
}

/// Runs the watches until shutdown, after winning the leader lease when election is enabled.
async fn run(
    config: &DynowatchConfig,
    client: Client,
    metrics: Metrics,
    probes: &ProbeState,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    let mut renewal = None;
    if config.leader_election.enabled {
        let settings = &config.leader_election;
        let namespace = settings
            .namespace
            .clone()
            .unwrap_or_else(|| client.default_namespace().to_string());
        let mut elector = LeaderElector::new(
            KubeLeaseStore::new(client.clone(), &namespace, settings),
            leader::identity(),
            settings.into(),
        );

        // Standby replicas report ready
        probes.set_ready(true);
        info!(
            lease = %settings.lease_name,
            namespace = %namespace,
            identity = %elector.identity(),
            "Waiting for leadership"
        );
        if !elector.acquire(&shutdown).await {
            return Ok(());
        }
        renewal = Some(tokio::spawn(elector.hold(shutdown.clone())));
    }

    let sender = Arc::new(HttpEventSender::new().map_err(ControllerError::Sender)?);
    let engine = KubeWatchEngine::new(
        client,
        config.watch_namespace.clone(),
        config.reconcile.clone(),
        metrics,
        shutdown.clone(),
    );

    let controller = Controller::setup(
        &engine,
        &config.watches,
        sender,
        &config.cloud_events.source_uri,
        &config.cloud_events.target_address,
    )
    .await?;
    probes.set_ready(true);
    info!(watches = ?controller.watch_names(), "Controller started");

    let result = controller.run(shutdown.clone()).await;
    shutdown.cancel();

    if let Some(renewal) = renewal {
        match renewal.await {
            Ok(Err(e)) => return Err(e),
            Ok(Ok(())) => {}
            Err(e) => error!("Lease renewal panicked: {}", e),
        }
    }
    result
}
