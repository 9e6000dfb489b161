//! Prometheus metrics.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `dynowatch_reconcile_total` | Counter | `watch`, `result` |
//! | `dynowatch_reconcile_duration_seconds` | Histogram | `watch` |

use crate::error::ControllerError;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Reconcile metrics of every watch loop.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconcile_total: IntCounterVec,
    reconcile_duration: HistogramVec,
}

impl Metrics {
    /// Creates the metrics and registers them with a fresh registry.
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("dynowatch_reconcile_total", "Reconcile invocations by outcome"),
            &["watch", "result"],
        )?;
        registry.register(Box::new(reconcile_total.clone()))?;

        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "dynowatch_reconcile_duration_seconds",
                "Time taken by reconcile invocations",
            ),
            &["watch"],
        )?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Self {
            registry,
            reconcile_total,
            reconcile_duration,
        })
    }

    /// Records one finished reconcile invocation.
    pub fn observe(&self, watch: &str, success: bool, elapsed: Duration) {
        let result = if success { "delivered" } else { "requeued" };
        self.reconcile_total.with_label_values(&[watch, result]).inc();
        self.reconcile_duration
            .with_label_values(&[watch])
            .observe(elapsed.as_secs_f64());
    }

    /// Encodes every metric in the Prometheus text format.
    pub fn render(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| ControllerError::Metrics(prometheus::Error::Msg(e.to_string())))
    }
}
