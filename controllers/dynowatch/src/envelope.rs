//! Notification envelope: the CloudEvent emitted for one reconcile request.

use crate::engine::ReconcileRequest;
use crate::error::ControllerError;
use cloudevents_client::CloudEvent;
use kube::api::GroupVersionKind;
use serde::{Deserialize, Serialize};

/// `type` attribute of every emitted event.
pub const EVENT_TYPE: &str = "dynowatch.kubearchive.dev";

/// Payload identifying the changed object. Carries no object state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    pub kind: String,
    pub api_version: String,
    pub namespace: String,
    pub name: String,
}

impl NotificationData {
    /// `apiVersion` is always `<group>/<version>`, so the core group gives `/v1`.
    pub fn new(gvk: &GroupVersionKind, request: &ReconcileRequest) -> Self {
        Self {
            kind: gvk.kind.clone(),
            api_version: format!("{}/{}", gvk.group, gvk.version),
            namespace: request.namespace.clone(),
            name: request.name.clone(),
        }
    }
}

/// Builds the event for `request` with a fresh id and the current time.
pub fn new_event(
    source: &str,
    gvk: &GroupVersionKind,
    request: &ReconcileRequest,
) -> Result<CloudEvent, ControllerError> {
    CloudEvent::new(source, EVENT_TYPE)
        .with_json_data(&NotificationData::new(gvk, request))
        .map_err(ControllerError::Envelope)
}
