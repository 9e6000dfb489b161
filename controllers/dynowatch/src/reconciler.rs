//! Reconciler: turns a reconcile request into a delivered notification.
//!
//! Each invocation reads the object's current state, emits one CloudEvent identifying it, and
//! returns an error when the event could not be delivered so the watch engine retries. An
//! object that no longer exists is a deletion and is notified like any other change.

use crate::config::WatchDescriptor;
use crate::engine::{ObjectFetcher, ReconcileHandler, ReconcileRequest};
use crate::envelope;
use crate::error::ControllerError;
use async_trait::async_trait;
use cloudevents_client::EventSender;
use kube::api::GroupVersionKind;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Reconciler for one watched kind.
pub struct Reconciler {
    name: String,
    gvk: GroupVersionKind,
    fetcher: Arc<dyn ObjectFetcher>,
    sender: Arc<dyn EventSender>,
    source: String,
    target: String,
}

impl Reconciler {
    pub fn new(
        descriptor: &WatchDescriptor,
        fetcher: Arc<dyn ObjectFetcher>,
        sender: Arc<dyn EventSender>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: descriptor.name.clone(),
            gvk: descriptor.gvk(),
            fetcher,
            sender,
            source: source.into(),
            target: target.into(),
        }
    }
}

#[async_trait]
impl ReconcileHandler for Reconciler {
    async fn reconcile(
        &self,
        request: &ReconcileRequest,
        cancel: &CancellationToken,
    ) -> Result<(), ControllerError> {
        let event = envelope::new_event(&self.source, &self.gvk, request)?;

        let object = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(ControllerError::Canceled(format!("fetching {request}")));
            }
            result = self.fetcher.fetch(&request.namespace, &request.name) => result?,
        };
        if object.is_none() {
            debug!(watch = %self.name, kind = %self.gvk.kind, "{} not found, notifying deletion", request);
        }

        let delivery = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(ControllerError::Canceled(format!("sending event for {request}")));
            }
            result = self.sender.send(&self.target, &event) => result,
        };
        if let Err(e) = delivery {
            error!(
                watch = %self.name,
                kind = %self.gvk.kind,
                target = %self.target,
                "Failed to send event for {}: {}", request, e
            );
            return Err(ControllerError::Undelivered(e));
        }

        info!(
            watch = %self.name,
            kind = %self.gvk.kind,
            id = %event.id,
            "Delivered event for {}", request
        );
        Ok(())
    }
}
