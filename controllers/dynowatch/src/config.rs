//! Configuration loading.
//!
//! Settings are layered with the `config` crate, highest precedence first: command-line flags,
//! `DYNOWATCH_*` environment variables, the `dynowatch.yaml` file, built-in defaults.
//!
//! Without `--config`, the first file found in this search path is used:
//! - `/etc/dynowatch`
//! - `$HOME/.dynowatch`
//! - `./config/manager` (below the working directory)
//!
//! A file that is not found in the search path is not an error.

use crate::error::ControllerError;
use clap::Parser;
use config::{Config, Environment, File, FileFormat, Map, Source, Value};
use kube::api::GroupVersionKind;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

const CONFIG_FILE_NAME: &str = "dynowatch.yaml";

const ENV_PREFIX: &str = "DYNOWATCH";

/// Environment variables (without prefix) and the keys they set.
const ENV_KEYS: &[(&str, &str)] = &[
    ("METRICS_BIND_ADDRESS", "metrics.bind-address"),
    ("HEALTHZ_BIND_ADDRESS", "healthz.bind-address"),
    ("CLOUD_EVENTS_SOURCE_URI", "cloud-events.source-uri"),
    ("CLOUD_EVENTS_TARGET_ADDRESS", "cloud-events.target-address"),
    ("WATCH_NAMESPACE", "watch-namespace"),
    ("LEADER_ELECT", "leader-election.enabled"),
];

/// Command-line flags.
#[derive(Debug, Default, Parser)]
#[command(
    name = "dynowatch",
    about = "Emits a CloudEvent for every change to watched Kubernetes resources"
)]
pub struct Args {
    /// Path to the configuration file. Skips the search path when set.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// The address the metric endpoint binds to.
    #[arg(long)]
    pub metrics_bind_address: Option<String>,

    /// The address the probe endpoint binds to.
    #[arg(long)]
    pub health_probe_bind_address: Option<String>,

    /// Source of the CloudEvent as a URI reference. The source plus ID of a CloudEvent should be
    /// uniquely identifiable.
    #[arg(long)]
    pub events_source_uri_ref: Option<String>,

    /// The target address to send CloudEvents to.
    #[arg(long)]
    pub events_target_address: Option<String>,

    /// Only watch namespaced kinds in this namespace.
    #[arg(long)]
    pub watch_namespace: Option<String>,

    /// Enable leader election for the controller. Enabling this will ensure there is only one
    /// active controller.
    #[arg(long)]
    pub leader_elect: bool,
}

impl Args {
    /// Keys set by the flags that were given.
    fn overrides(&self) -> Vec<(&'static str, Option<Value>)> {
        vec![
            ("metrics.bind-address", self.metrics_bind_address.clone().map(Value::from)),
            ("healthz.bind-address", self.health_probe_bind_address.clone().map(Value::from)),
            ("cloud-events.source-uri", self.events_source_uri_ref.clone().map(Value::from)),
            ("cloud-events.target-address", self.events_target_address.clone().map(Value::from)),
            ("watch-namespace", self.watch_namespace.clone().map(Value::from)),
            ("leader-election.enabled", self.leader_elect.then(|| Value::from(true))),
        ]
    }
}

/// One resource kind to watch.
///
/// `group` is empty for the core API group. Names are labels only; two descriptors with the
/// same name produce two independent watch loops.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchDescriptor {
    /// Label used in logs and metrics
    pub name: String,
    /// API group, empty for core
    #[serde(default)]
    pub group: String,
    /// API version
    pub version: String,
    /// Kind
    pub kind: String,
}

impl WatchDescriptor {
    /// Creates a descriptor.
    pub fn new(name: &str, group: &str, version: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// The descriptor's group/version/kind.
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    fn validate(&self, index: usize) -> Result<(), ControllerError> {
        for (field, value) in [("name", &self.name), ("version", &self.version), ("kind", &self.kind)] {
            if value.trim().is_empty() {
                return Err(ControllerError::InvalidConfig(format!(
                    "watches[{index}] is missing `{field}`"
                )));
            }
        }
        Ok(())
    }
}

/// CloudEvents settings shared by every watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CloudEventConfig {
    /// `source` attribute of emitted events
    pub source_uri: String,
    /// Address events are POSTed to
    pub target_address: String,
}

impl Default for CloudEventConfig {
    fn default() -> Self {
        Self {
            source_uri: "localhost".to_string(),
            target_address: "http://localhost:8082".to_string(),
        }
    }
}

/// Probe endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HealthzConfig {
    /// Listen address, `:port` means all interfaces
    pub bind_address: String,
}

impl Default for HealthzConfig {
    fn default() -> Self {
        Self {
            bind_address: ":8081".to_string(),
        }
    }
}

/// Metrics endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MetricsConfig {
    /// Listen address, `:port` means all interfaces
    pub bind_address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bind_address: ":8080".to_string(),
        }
    }
}

/// Work queue settings applied to every watch loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ReconcileConfig {
    /// Reconciliations running at once per watch
    pub max_concurrent: usize,
    /// Deadline of a single reconciliation
    pub timeout_seconds: u64,
    /// First requeue delay after a failure
    pub min_backoff_seconds: u64,
    /// Cap on the requeue delay
    pub max_backoff_seconds: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            timeout_seconds: 30,
            min_backoff_seconds: 1,
            max_backoff_seconds: 300,
        }
    }
}

/// Lease-based leader election settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LeaderElectionConfig {
    /// Only the lease holder runs watches when set
    pub enabled: bool,
    /// Name of the `Lease` object
    pub lease_name: String,
    /// Namespace of the lease, the client's default namespace when unset
    pub namespace: Option<String>,
    /// How long a lease is valid without renewal
    pub lease_duration_seconds: u64,
    /// How long the holder keeps retrying a failed renewal
    pub renew_deadline_seconds: u64,
    /// Wait between acquire or renew attempts
    pub retry_period_seconds: u64,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lease_name: "fc6a04ff.kubearchive.io".to_string(),
            namespace: None,
            lease_duration_seconds: 15,
            renew_deadline_seconds: 10,
            retry_period_seconds: 2,
        }
    }
}

impl LeaderElectionConfig {
    fn validate(&self) -> Result<(), ControllerError> {
        if self.lease_name.trim().is_empty() {
            return Err(ControllerError::InvalidConfig(
                "leader-election.lease-name must not be empty".to_string(),
            ));
        }
        if self.retry_period_seconds == 0
            || self.renew_deadline_seconds <= self.retry_period_seconds
            || self.lease_duration_seconds <= self.renew_deadline_seconds
        {
            return Err(ControllerError::InvalidConfig(format!(
                "leader-election needs 0 < retry-period-seconds ({}) < renew-deadline-seconds ({}) < lease-duration-seconds ({})",
                self.retry_period_seconds, self.renew_deadline_seconds, self.lease_duration_seconds
            )));
        }
        Ok(())
    }
}

/// Complete controller configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DynowatchConfig {
    /// Metrics endpoint
    pub metrics: MetricsConfig,
    /// Probe endpoint
    pub healthz: HealthzConfig,
    /// Event source and target
    pub cloud_events: CloudEventConfig,
    /// Restrict namespaced kinds to one namespace
    pub watch_namespace: Option<String>,
    /// Work queue tuning
    pub reconcile: ReconcileConfig,
    /// Single active replica
    pub leader_election: LeaderElectionConfig,
    /// Kinds to watch, in order
    pub watches: Vec<WatchDescriptor>,
}

impl DynowatchConfig {
    /// Loads the configuration from file, environment and flags, then validates it.
    pub fn load(args: &Args) -> Result<Self, ControllerError> {
        let path = args.config.clone().or_else(Self::find_config_file);
        let file = path
            .as_deref()
            .map(|path| File::from(path).format(FileFormat::Yaml).required(true));
        Self::layered(file, Environment::with_prefix(ENV_PREFIX), args)
    }

    fn layered<S>(file: Option<S>, env: Environment, args: &Args) -> Result<Self, ControllerError>
    where
        S: Source + Send + Sync + 'static,
    {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        builder = builder.add_source(EnvKeys(env.prefix_separator("_")));
        for (key, value) in args.overrides() {
            builder = builder.set_override_option(key, value)?;
        }

        let mut config: Self = builder.build()?.try_deserialize()?;
        config.watch_namespace = config.watch_namespace.filter(|ns| !ns.is_empty());
        config.validate()?;
        Ok(config)
    }

    fn find_config_file() -> Option<PathBuf> {
        let mut dirs = vec![PathBuf::from("/etc/dynowatch")];
        if let Some(home) = std::env::var_os("HOME") {
            dirs.push(PathBuf::from(home).join(".dynowatch"));
        }
        dirs.push(PathBuf::from("config/manager"));

        dirs.into_iter()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .find(|path| path.is_file())
    }

    /// Checks the settings that would otherwise fail later at startup.
    pub fn validate(&self) -> Result<(), ControllerError> {
        for (index, watch) in self.watches.iter().enumerate() {
            watch.validate(index)?;
        }
        if self.cloud_events.target_address.trim().is_empty() {
            return Err(ControllerError::InvalidConfig(
                "cloud-events.target-address must not be empty".to_string(),
            ));
        }
        if self.reconcile.max_concurrent == 0 {
            return Err(ControllerError::InvalidConfig(
                "reconcile.max-concurrent must be at least 1".to_string(),
            ));
        }
        if self.reconcile.timeout_seconds == 0 {
            return Err(ControllerError::InvalidConfig(
                "reconcile.timeout-seconds must be at least 1".to_string(),
            ));
        }
        if self.reconcile.min_backoff_seconds == 0 {
            return Err(ControllerError::InvalidConfig(
                "reconcile.min-backoff-seconds must be at least 1".to_string(),
            ));
        }
        if self.reconcile.min_backoff_seconds > self.reconcile.max_backoff_seconds {
            return Err(ControllerError::InvalidConfig(format!(
                "reconcile.min-backoff-seconds ({}) exceeds reconcile.max-backoff-seconds ({})",
                self.reconcile.min_backoff_seconds, self.reconcile.max_backoff_seconds
            )));
        }
        if self.leader_election.enabled {
            self.leader_election.validate()?;
        }
        parse_bind_address(&self.metrics.bind_address)?;
        parse_bind_address(&self.healthz.bind_address)?;
        Ok(())
    }
}

/// `DYNOWATCH_*` variables mapped onto their configuration keys.
///
/// Variable names flatten the key path with single underscores, so they are looked up in
/// [`ENV_KEYS`] instead of being split on a separator. Unknown variables are ignored.
#[derive(Debug, Clone)]
struct EnvKeys(Environment);

impl Source for EnvKeys {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<Map<String, Value>, config::ConfigError> {
        Ok(self
            .0
            .collect()?
            .into_iter()
            .filter_map(|(variable, value)| {
                ENV_KEYS
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(&variable))
                    .map(|(_, key)| ((*key).to_string(), value))
            })
            .collect())
    }
}

/// Parses a bind address, accepting the `:port` shorthand for all interfaces.
pub fn parse_bind_address(address: &str) -> Result<SocketAddr, ControllerError> {
    let full = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };
    full.parse()
        .map_err(|e| ControllerError::InvalidConfig(format!("invalid bind address {address}: {e}")))
}
