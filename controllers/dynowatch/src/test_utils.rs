//! Test utilities for unit testing the reconciler, watch loop and controller
//!
//! This module provides an in-memory cluster, a watch engine that delivers requests on demand,
//! and a handler that records how it was invoked.

use crate::config::WatchDescriptor;
use crate::engine::{ObjectFetcher, ReconcileHandler, ReconcileRequest, WatchEngine, WatchLoop};
use crate::error::ControllerError;
use async_trait::async_trait;
use cloudevents_client::{CloudEvent, CloudEventError, EventSender};
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Helper to create a test object of any kind
pub fn create_test_object(
    group: &str,
    version: &str,
    kind: &str,
    namespace: Option<&str>,
    name: &str,
) -> DynamicObject {
    let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));
    let object = DynamicObject::new(name, &resource);
    match namespace {
        Some(ns) => object.within(ns),
        None => object,
    }
}

/// The `jobs` watch used across tests
pub fn jobs_descriptor() -> WatchDescriptor {
    WatchDescriptor::new("jobs", "batch", "v1", "Job")
}

/// Polls `condition` until it holds, panicking after five seconds
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not met within 5s");
}

/// How fetches from a [`FakeCluster`] misbehave
#[derive(Debug, Clone)]
pub enum FailureMode {
    /// Fail with [`ControllerError::Fetch`]
    Fetch(String),
    /// Never complete
    Hang,
}

#[derive(Default)]
struct ClusterState {
    objects: Mutex<HashMap<(String, String), DynamicObject>>,
    failure: Mutex<Option<FailureMode>>,
    fetches: AtomicUsize,
}

/// In-memory set of Job objects
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, namespace: &str, name: &str) {
        let object = create_test_object("batch", "v1", "Job", Some(namespace), name);
        self.state
            .objects
            .lock()
            .insert((namespace.to_string(), name.to_string()), object);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.state
            .objects
            .lock()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn set_failure(&self, mode: FailureMode) {
        *self.state.failure.lock() = Some(mode);
    }

    pub fn fetch_count(&self) -> usize {
        self.state.fetches.load(Ordering::SeqCst)
    }

    pub fn fetcher(&self) -> Arc<dyn ObjectFetcher> {
        Arc::new(FakeFetcher {
            cluster: self.clone(),
        })
    }
}

/// Fetcher reading from a [`FakeCluster`]
pub struct FakeFetcher {
    cluster: FakeCluster,
}

#[async_trait]
impl ObjectFetcher for FakeFetcher {
    async fn fetch(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, ControllerError> {
        let state = &self.cluster.state;
        state.fetches.fetch_add(1, Ordering::SeqCst);
        let failure = state.failure.lock().clone();
        match failure {
            Some(FailureMode::Fetch(reason)) => Err(ControllerError::Fetch(reason)),
            Some(FailureMode::Hang) => std::future::pending().await,
            None => Ok(state
                .objects
                .lock()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()),
        }
    }
}

/// Watch engine that runs no watches; tests deliver requests with [`FakeWatchEngine::trigger`]
pub struct FakeWatchEngine {
    cluster: FakeCluster,
    known_kinds: HashSet<(String, String, String)>,
    attempts: Mutex<Vec<String>>,
    handlers: Mutex<Vec<(String, Arc<dyn ReconcileHandler>)>>,
    stop: CancellationToken,
}

impl FakeWatchEngine {
    pub fn new(cluster: FakeCluster) -> Self {
        Self {
            cluster,
            known_kinds: HashSet::new(),
            attempts: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            stop: CancellationToken::new(),
        }
    }

    /// Makes a kind resolvable
    pub fn with_kind(mut self, group: &str, version: &str, kind: &str) -> Self {
        self.known_kinds
            .insert((group.to_string(), version.to_string(), kind.to_string()));
        self
    }

    /// Watch names in the order registration was attempted
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    /// Number of loops registered under `watch`
    pub fn loop_count(&self, watch: &str) -> usize {
        self.handlers.lock().iter().filter(|(name, _)| name == watch).count()
    }

    /// Delivers `request` to every loop registered under `watch`
    pub async fn trigger(
        &self,
        watch: &str,
        request: &ReconcileRequest,
    ) -> Vec<Result<(), ControllerError>> {
        let handlers: Vec<_> = self
            .handlers
            .lock()
            .iter()
            .filter(|(name, _)| name == watch)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        let cancel = CancellationToken::new();
        let mut results = Vec::with_capacity(handlers.len());
        for handler in handlers {
            results.push(handler.reconcile(request, &cancel).await);
        }
        results
    }

    /// Ends every loop with `Ok`
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

#[async_trait]
impl WatchEngine for FakeWatchEngine {
    async fn register<F>(
        &self,
        descriptor: &WatchDescriptor,
        bind: F,
    ) -> Result<WatchLoop, ControllerError>
    where
        F: FnOnce(Arc<dyn ObjectFetcher>) -> Arc<dyn ReconcileHandler> + Send + 'static,
    {
        self.attempts.lock().push(descriptor.name.clone());
        let key = (
            descriptor.group.clone(),
            descriptor.version.clone(),
            descriptor.kind.clone(),
        );
        if !self.known_kinds.contains(&key) {
            return Err(ControllerError::Registration(format!(
                "no matches for kind {} in version {}",
                descriptor.kind,
                descriptor.gvk().api_version()
            )));
        }

        let handler = bind(self.cluster.fetcher());
        self.handlers.lock().push((descriptor.name.clone(), handler));

        let stop = self.stop.clone();
        Ok(tokio::spawn(async move {
            stop.cancelled().await;
            Ok(())
        }))
    }
}

/// Handler that records its invocations and can be told to fail or hang
#[derive(Default)]
pub struct RecordingHandler {
    delay: Duration,
    calls: Mutex<Vec<ReconcileRequest>>,
    failures_left: AtomicUsize,
    hang_next: AtomicBool,
    successes: AtomicUsize,
    active: Mutex<HashMap<ReconcileRequest, usize>>,
    max_overlap: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each invocation takes `delay`
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// The next `count` invocations fail
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// The next invocation waits until it is canceled
    pub fn hang_next(&self) {
        self.hang_next.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ReconcileRequest> {
        self.calls.lock().clone()
    }

    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    /// Invocations currently running
    pub fn in_flight(&self) -> usize {
        self.active.lock().values().sum()
    }

    /// Most invocations ever running at once for a single request
    pub fn max_overlap(&self) -> usize {
        self.max_overlap.load(Ordering::SeqCst)
    }
}

/// Counts an invocation as running until dropped, including when its future is dropped
struct ActiveGuard<'a> {
    active: &'a Mutex<HashMap<ReconcileRequest, usize>>,
    request: ReconcileRequest,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&self.request) {
            *count -= 1;
            if *count == 0 {
                active.remove(&self.request);
            }
        }
    }
}

#[async_trait]
impl ReconcileHandler for RecordingHandler {
    async fn reconcile(
        &self,
        request: &ReconcileRequest,
        cancel: &CancellationToken,
    ) -> Result<(), ControllerError> {
        self.calls.lock().push(request.clone());
        let overlap = {
            let mut active = self.active.lock();
            let count = active.entry(request.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.max_overlap.fetch_max(overlap, Ordering::SeqCst);
        let _guard = ActiveGuard {
            active: &self.active,
            request: request.clone(),
        };

        if self.hang_next.swap(false, Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(ControllerError::Canceled(request.to_string()));
        }
        tokio::time::sleep(self.delay).await;

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ControllerError::Fetch("injected failure".to_string()));
        }
        self.successes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Event sender whose deliveries never complete
#[derive(Debug, Clone, Default)]
pub struct HangingSender {
    attempts: Arc<AtomicUsize>,
}

impl HangingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends started so far
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSender for HangingSender {
    async fn send(&self, _target: &str, _event: &CloudEvent) -> Result<(), CloudEventError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<Result<(), CloudEventError>>().await
    }
}
