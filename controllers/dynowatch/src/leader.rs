//! Lease-based leader election.
//!
//! With leader election enabled only the replica holding a `coordination.k8s.io/v1` Lease runs
//! the watches. The others poll the lease and take it over once it has gone a full lease
//! duration without being renewed.
//!
//! Expiry is judged from local observation only: a candidate remembers when it last saw the
//! lease record change and never compares the timestamps written by other replicas with its own
//! clock.

use crate::config::LeaderElectionConfig;
use crate::error::ControllerError;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Identity of this replica: the pod's host name plus a random suffix.
pub fn identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "dynowatch".to_string());
    format!("{}_{}", host, uuid::Uuid::new_v4())
}

/// The parts of a lease the election looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder: Option<String>,
    pub resource_version: Option<String>,
    pub transitions: i32,
}

impl LeaseRecord {
    fn from_lease(lease: &Lease) -> Self {
        let spec = lease.spec.as_ref();
        Self {
            holder: spec.and_then(|spec| spec.holder_identity.clone()),
            resource_version: lease.metadata.resource_version.clone(),
            transitions: spec.and_then(|spec| spec.lease_transitions).unwrap_or(0),
        }
    }
}

/// Storage of the lease object.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Current lease, `None` when it does not exist yet.
    async fn get(&self) -> Result<Option<LeaseRecord>, ControllerError>;

    /// Creates the lease held by `holder`. `Ok(false)` when it already exists.
    async fn create(&self, holder: &str) -> Result<bool, ControllerError>;

    /// Writes `holder` into the lease unless it changed since `current` was read, in which case
    /// `Ok(false)` is returned.
    async fn update(&self, current: &LeaseRecord, holder: &str) -> Result<bool, ControllerError>;
}

/// Lease stored in the cluster.
pub struct KubeLeaseStore {
    api: Api<Lease>,
    name: String,
    lease_duration_seconds: i32,
}

impl KubeLeaseStore {
    pub fn new(client: Client, namespace: &str, settings: &LeaderElectionConfig) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: settings.lease_name.clone(),
            lease_duration_seconds: i32::try_from(settings.lease_duration_seconds)
                .unwrap_or(i32::MAX),
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self) -> Result<Option<LeaseRecord>, ControllerError> {
        Ok(self
            .api
            .get_opt(&self.name)
            .await?
            .as_ref()
            .map(LeaseRecord::from_lease))
    }

    async fn create(&self, holder: &str) -> Result<bool, ControllerError> {
        let now = now();
        let lease: Lease = serde_json::from_value(json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": { "name": self.name },
            "spec": {
                "holderIdentity": holder,
                "leaseDurationSeconds": self.lease_duration_seconds,
                "acquireTime": now,
                "renewTime": now,
                "leaseTransitions": 0,
            }
        }))
        .map_err(|e| ControllerError::LeaderElection(format!("lease {}: {}", self.name, e)))?;

        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, current: &LeaseRecord, holder: &str) -> Result<bool, ControllerError> {
        let now = now();
        let mut spec = json!({
            "holderIdentity": holder,
            "leaseDurationSeconds": self.lease_duration_seconds,
            "renewTime": now,
        });
        if current.holder.as_deref() != Some(holder) {
            spec["acquireTime"] = json!(now);
            spec["leaseTransitions"] = json!(current.transitions.saturating_add(1));
        }
        // The resource version makes the API server reject writes based on a stale read
        let patch = json!({
            "metadata": { "resourceVersion": current.resource_version },
            "spec": spec,
        });

        match self
            .api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Durations steering the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTiming {
    /// How long an unchanged lease held by another replica is respected
    pub lease_duration: Duration,
    /// How long the leader keeps retrying a failed renewal before giving up
    pub renew_deadline: Duration,
    /// Wait between attempts
    pub retry_period: Duration,
}

impl From<&LeaderElectionConfig> for ElectionTiming {
    fn from(settings: &LeaderElectionConfig) -> Self {
        Self {
            lease_duration: Duration::from_secs(settings.lease_duration_seconds),
            renew_deadline: Duration::from_secs(settings.renew_deadline_seconds),
            retry_period: Duration::from_secs(settings.retry_period_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseAction {
    Create,
    Renew,
    TakeOver,
    Wait,
}

/// The lease record last seen and when it was first seen in that state.
#[derive(Debug)]
struct Observed {
    record: LeaseRecord,
    since: Instant,
}

/// Competes for the lease on behalf of one replica.
pub struct LeaderElector<S> {
    store: S,
    identity: String,
    timing: ElectionTiming,
    observed: Option<Observed>,
}

impl<S: LeaseStore> LeaderElector<S> {
    pub fn new(store: S, identity: String, timing: ElectionTiming) -> Self {
        Self {
            store,
            identity,
            timing,
            observed: None,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn decide(&mut self, record: Option<&LeaseRecord>, now: Instant) -> LeaseAction {
        let Some(record) = record else {
            self.observed = None;
            return LeaseAction::Create;
        };

        let since = match &self.observed {
            Some(observed) if observed.record == *record => observed.since,
            _ => now,
        };
        self.observed = Some(Observed {
            record: record.clone(),
            since,
        });

        match record.holder.as_deref() {
            Some(holder) if holder == self.identity => LeaseAction::Renew,
            None | Some("") => LeaseAction::TakeOver,
            Some(_) if now.duration_since(since) >= self.timing.lease_duration => {
                LeaseAction::TakeOver
            }
            Some(_) => LeaseAction::Wait,
        }
    }

    /// One attempt to become or stay the holder. `Ok(true)` when this replica holds the lease.
    pub async fn try_acquire_or_renew(&mut self) -> Result<bool, ControllerError> {
        let current = self.store.get().await?;
        match self.decide(current.as_ref(), Instant::now()) {
            LeaseAction::Create => self.store.create(&self.identity).await,
            LeaseAction::Renew | LeaseAction::TakeOver => match &current {
                Some(current) => self.store.update(current, &self.identity).await,
                None => Ok(false),
            },
            LeaseAction::Wait => Ok(false),
        }
    }

    /// Waits until this replica holds the lease. Returns `false` when `shutdown` comes first.
    pub async fn acquire(&mut self, shutdown: &CancellationToken) -> bool {
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leadership");
                    return true;
                }
                Ok(false) => debug!(identity = %self.identity, "Lease held by another replica"),
                Err(e) => warn!(identity = %self.identity, "Failed to acquire lease: {}", e),
            }

            tokio::select! {
                biased;
                () = shutdown.cancelled() => return false,
                () = tokio::time::sleep(self.timing.retry_period) => {}
            }
        }
    }

    /// Renews the lease until `shutdown` is canceled.
    ///
    /// When no renewal succeeds for a full renew deadline the lease is considered lost:
    /// `shutdown` is canceled and [`ControllerError::LeaderElection`] is returned.
    pub async fn hold(mut self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let mut renewed = Instant::now();
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.timing.retry_period) => {}
            }

            match self.try_acquire_or_renew().await {
                Ok(true) => renewed = Instant::now(),
                Ok(false) => warn!(identity = %self.identity, "Lease renewal rejected"),
                Err(e) => warn!(identity = %self.identity, "Failed to renew lease: {}", e),
            }

            if renewed.elapsed() >= self.timing.renew_deadline {
                error!(identity = %self.identity, "Leadership lost");
                shutdown.cancel();
                return Err(ControllerError::LeaderElection(format!(
                    "lease not renewed within {:?}",
                    self.timing.renew_deadline
                )));
            }
        }
    }
}
