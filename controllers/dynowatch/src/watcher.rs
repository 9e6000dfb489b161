//! Kubernetes watch engine.
//!
//! Every registered watch runs one loop: a `kube_runtime` watcher turns object changes into
//! reconcile requests, a [`WorkQueue`] deduplicates and retries them, and up to
//! `max-concurrent` requests are handed to the watch's handler at a time.
//!
//! Deleted objects are reconciled like any other change, so the handler sees every change.
//! Watch stream errors are logged and the stream reconnects with backoff. Objects that were
//! deleted while the stream was disconnected are reconciled once the relist completes.

use crate::backoff::FibonacciBackoff;
use crate::config::{ReconcileConfig, WatchDescriptor};
use crate::engine::{ObjectFetcher, ReconcileHandler, ReconcileRequest, WatchEngine, WatchLoop};
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::queue::WorkQueue;
use async_trait::async_trait;
use futures::{Stream, StreamExt, future, stream};
use kube::api::{ApiResource, DynamicObject};
use kube::discovery::{self, Scope};
use kube::{Api, Client};
use kube_runtime::watcher::Event;
use kube_runtime::{WatchStreamExt, watcher};
use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reads objects of one discovered kind through the API server.
pub struct KubeObjectFetcher {
    client: Client,
    resource: ApiResource,
    namespaced: bool,
}

#[async_trait]
impl ObjectFetcher for KubeObjectFetcher {
    async fn fetch(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, ControllerError> {
        let api: Api<DynamicObject> = if self.namespaced {
            Api::namespaced_with(self.client.clone(), namespace, &self.resource)
        } else {
            Api::all_with(self.client.clone(), &self.resource)
        };
        api.get_opt(name)
            .await
            .map_err(|e| ControllerError::Fetch(format!("{}/{}: {}", namespace, name, e)))
    }
}

/// Watch engine backed by a Kubernetes cluster.
pub struct KubeWatchEngine {
    client: Client,
    namespace: Option<String>,
    settings: ReconcileConfig,
    metrics: Metrics,
    shutdown: CancellationToken,
}

impl KubeWatchEngine {
    /// Creates an engine. Namespaced kinds are watched in `namespace` only when it is set.
    /// Loops stop when `shutdown` is canceled.
    pub fn new(
        client: Client,
        namespace: Option<String>,
        settings: ReconcileConfig,
        metrics: Metrics,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            namespace,
            settings,
            metrics,
            shutdown,
        }
    }
}

#[async_trait]
impl WatchEngine for KubeWatchEngine {
    async fn register<F>(
        &self,
        descriptor: &WatchDescriptor,
        bind: F,
    ) -> Result<WatchLoop, ControllerError>
    where
        F: FnOnce(Arc<dyn ObjectFetcher>) -> Arc<dyn ReconcileHandler> + Send + 'static,
    {
        let gvk = descriptor.gvk();
        let (resource, caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| {
                ControllerError::Registration(format!(
                    "watch {}: unable to resolve kind {} in {}: {}",
                    descriptor.name,
                    gvk.kind,
                    gvk.api_version(),
                    e
                ))
            })?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);

        let handler = bind(Arc::new(KubeObjectFetcher {
            client: self.client.clone(),
            resource: resource.clone(),
            namespaced,
        }));

        let api: Api<DynamicObject> = match (&self.namespace, namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &resource),
            _ => Api::all_with(self.client.clone(), &resource),
        };
        let name = descriptor.name.clone();
        let requests = change_requests(api, name.clone());
        let settings = self.settings.clone();
        let metrics = self.metrics.clone();
        let shutdown = self.shutdown.clone();

        info!(watch = %name, kind = %gvk.kind, api_version = %gvk.api_version(), namespaced, "Starting watch");
        Ok(tokio::spawn(async move {
            drive(&name, requests, handler, &settings, &metrics, &shutdown).await
        }))
    }
}

/// One reconcile request per observed change, including deletions.
fn change_requests(
    api: Api<DynamicObject>,
    watch: String,
) -> impl Stream<Item = ReconcileRequest> + Send + 'static {
    track_changes(watcher(api, watcher::Config::default()).default_backoff(), watch)
}

/// Maps watcher events to reconcile requests, adding the objects a relist no longer returns.
fn track_changes<S, E>(events: S, watch: String) -> impl Stream<Item = ReconcileRequest> + Send
where
    S: Stream<Item = Result<Event<DynamicObject>, E>> + Send,
    E: Display,
{
    let mut objects = KnownObjects::default();
    events.flat_map(move |event| {
        let requests = match event {
            Ok(Event::Init) => {
                debug!(watch = %watch, "Listing objects");
                objects.observe(Event::Init)
            }
            Ok(Event::InitDone) => {
                let gone = objects.observe(Event::InitDone);
                info!(watch = %watch, deleted = gone.len(), "Initial list complete");
                gone
            }
            Ok(event) => objects.observe(event),
            Err(e) => {
                warn!(watch = %watch, "Watch stream error, retrying: {}", e);
                Vec::new()
            }
        };
        stream::iter(requests)
    })
}

/// Objects a watch has seen and not seen deleted.
#[derive(Debug, Default)]
struct KnownObjects {
    known: HashSet<ReconcileRequest>,
    /// Objects returned by the relist in progress
    relisted: Option<HashSet<ReconcileRequest>>,
}

impl KnownObjects {
    fn observe(&mut self, event: Event<DynamicObject>) -> Vec<ReconcileRequest> {
        match event {
            Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(object) => {
                let request = ReconcileRequest::from_object(&object);
                self.relisted
                    .get_or_insert_with(HashSet::new)
                    .insert(request.clone());
                vec![request]
            }
            Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let gone = self.known.difference(&relisted).cloned().collect();
                self.known = relisted;
                gone
            }
            Event::Apply(object) => {
                let request = ReconcileRequest::from_object(&object);
                if let Some(relisted) = &mut self.relisted {
                    relisted.insert(request.clone());
                }
                self.known.insert(request.clone());
                vec![request]
            }
            Event::Delete(object) => {
                let request = ReconcileRequest::from_object(&object);
                if let Some(relisted) = &mut self.relisted {
                    relisted.remove(&request);
                }
                self.known.remove(&request);
                vec![request]
            }
        }
    }
}

/// Runs one watch loop until `shutdown` is canceled.
///
/// Fails with [`ControllerError::Watch`] when `requests` ends first.
pub async fn drive<S>(
    watch: &str,
    requests: S,
    handler: Arc<dyn ReconcileHandler>,
    settings: &ReconcileConfig,
    metrics: &Metrics,
    shutdown: &CancellationToken,
) -> Result<(), ControllerError>
where
    S: Stream<Item = ReconcileRequest> + Send,
{
    let backoff = FibonacciBackoff::new(settings.min_backoff_seconds, settings.max_backoff_seconds);
    let (queue, mut ready) = WorkQueue::new(backoff);
    let timeout = Duration::from_secs(settings.timeout_seconds);

    let producer = {
        let queue = Arc::clone(&queue);
        requests.for_each(move |request| {
            queue.add(request);
            future::ready(())
        })
    };

    let consumer = stream::poll_fn(move |cx| ready.poll_recv(cx)).for_each_concurrent(
        settings.max_concurrent.max(1),
        |request| {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            async move {
                process(watch, request, &queue, handler.as_ref(), metrics, timeout, shutdown).await;
            }
        },
    );

    tokio::select! {
        () = shutdown.cancelled() => {
            info!(watch = %watch, "Stopping watch");
            Ok(())
        }
        () = producer => Err(ControllerError::Watch(format!("event stream of watch {watch} ended"))),
        () = consumer => Err(ControllerError::Watch(format!("work queue of watch {watch} closed"))),
    }
}

async fn process(
    watch: &str,
    request: ReconcileRequest,
    queue: &Arc<WorkQueue>,
    handler: &dyn ReconcileHandler,
    metrics: &Metrics,
    timeout: Duration,
    shutdown: &CancellationToken,
) {
    queue.start(&request);
    let cancel = shutdown.child_token();
    let started = Instant::now();

    let result = match tokio::time::timeout(timeout, handler.reconcile(&request, &cancel)).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(ControllerError::Canceled(format!("{request} exceeded {timeout:?}")))
        }
    };
    metrics.observe(watch, result.is_ok(), started.elapsed());

    match result {
        Ok(()) => queue.forget(&request),
        Err(e) => {
            let delay = queue.requeue_after_failure(&request);
            warn!(
                watch = %watch,
                failures = queue.failures(&request),
                "Reconciliation failed for {}, retrying in {:?}: {}", request, delay, e
            );
        }
    }
    queue.done(&request);
}
