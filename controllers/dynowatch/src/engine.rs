//! Seams between the reconciler and the watch machinery.
//!
//! A [`WatchEngine`] turns a [`WatchDescriptor`] into a running watch loop. It resolves the
//! kind, hands the kind-bound [`ObjectFetcher`] to the caller so the caller can build its
//! [`ReconcileHandler`], then delivers a [`ReconcileRequest`] to that handler for every
//! observed change.

use crate::config::WatchDescriptor;
use crate::error::ControllerError;
use async_trait::async_trait;
use kube::ResourceExt;
use kube::api::DynamicObject;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Identifies one object of a watched kind. The namespace is empty for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReconcileRequest {
    pub namespace: String,
    pub name: String,
}

impl ReconcileRequest {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Request for the object a watch event carried.
    pub fn from_object(object: &DynamicObject) -> Self {
        Self::new(object.namespace().unwrap_or_default(), object.name_any())
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Reads the current state of objects of one kind.
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// Returns `Ok(None)` when the object does not exist.
    async fn fetch(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, ControllerError>;
}

/// Handles one reconcile request. An `Err` makes the engine retry the request later.
#[async_trait]
pub trait ReconcileHandler: Send + Sync {
    async fn reconcile(
        &self,
        request: &ReconcileRequest,
        cancel: &CancellationToken,
    ) -> Result<(), ControllerError>;
}

/// A running watch loop. Completes when the loop stops.
pub type WatchLoop = JoinHandle<Result<(), ControllerError>>;

/// Starts watch loops.
#[async_trait]
pub trait WatchEngine: Send + Sync {
    /// Registers a watch for `descriptor`'s kind.
    ///
    /// `bind` receives the fetcher bound to the resolved kind and returns the handler the loop
    /// feeds. Fails with [`ControllerError::Registration`] when the kind cannot be resolved.
    async fn register<F>(
        &self,
        descriptor: &WatchDescriptor,
        bind: F,
    ) -> Result<WatchLoop, ControllerError>
    where
        F: FnOnce(Arc<dyn ObjectFetcher>) -> Arc<dyn ReconcileHandler> + Send + 'static;
}
