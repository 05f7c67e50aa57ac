/*!
Observability for the snapshot store.

- Structured logging through a `tracing` subscriber with JSON output
- Prometheus metrics per storage operation (`metrics` feature)
*/

#[cfg(feature = "metrics")]
use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Instant;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{Result, StoreError};

/// Global metrics instance, `None` when registration failed
#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<StoreMetrics>> = OnceLock::new();

/// Prometheus metrics for storage operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct StoreMetrics {
    pub operations_total: IntCounterVec,
    pub operation_errors_total: IntCounterVec,
    pub operation_latency_seconds: HistogramVec,
    pub snapshot_nodes: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
impl StoreMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();
        let metric_error = |e: prometheus::Error| StoreError::configuration(format!("Failed to create metric: {e}"));

        let operations_total = IntCounterVec::new(
            Opts::new("stathive_operations_total", "Storage operations started"),
            &["backend", "operation"],
        )
        .map_err(metric_error)?;

        let operation_errors_total = IntCounterVec::new(
            Opts::new("stathive_operation_errors_total", "Storage operations that failed"),
            &["backend", "operation", "kind"],
        )
        .map_err(metric_error)?;

        let operation_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "stathive_operation_latency_seconds",
                "Duration of storage operations in seconds",
            ),
            &["backend", "operation"],
        )
        .map_err(metric_error)?;

        let node_buckets = exponential_buckets(1.0, 4.0, 10).map_err(metric_error)?;
        let snapshot_nodes = Histogram::with_opts(
            HistogramOpts::new("stathive_snapshot_nodes", "Nodes per saved snapshot tree").buckets(node_buckets),
        )
        .map_err(metric_error)?;

        registry
            .register(Box::new(operations_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(operation_errors_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(operation_latency_seconds.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(snapshot_nodes.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            operations_total,
            operation_errors_total,
            operation_latency_seconds,
            snapshot_nodes,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> Option<&'static StoreMetrics> {
        METRICS
            .get_or_init(|| {
                Self::new()
                    .map_err(|e| tracing::warn!(error = %e, "metrics disabled"))
                    .ok()
            })
            .as_ref()
    }

    pub fn record_snapshot_nodes(&self, nodes: usize) {
        self.snapshot_nodes.observe(nodes as f64);
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let families = self.registry.gather();
        TextEncoder::new()
            .encode_to_string(&families)
            .map_err(|e| StoreError::configuration(format!("Failed to encode metrics: {e}")))
    }
}

/// Measures one storage operation
#[cfg(feature = "metrics")]
pub struct OperationTimer {
    start: Instant,
    backend: &'static str,
    operation: &'static str,
}

#[cfg(feature = "metrics")]
impl OperationTimer {
    /// Count the operation and start the clock
    pub fn start(backend: &'static str, operation: &'static str) -> Self {
        if let Some(metrics) = StoreMetrics::global() {
            metrics
                .operations_total
                .with_label_values(&[backend, operation])
                .inc();
        }
        Self {
            start: Instant::now(),
            backend,
            operation,
        }
    }

    /// Record latency, and the error kind when the operation failed
    pub fn finish(self, error: Option<&StoreError>) {
        let Some(metrics) = StoreMetrics::global() else {
            return;
        };
        metrics
            .operation_latency_seconds
            .with_label_values(&[self.backend, self.operation])
            .observe(self.start.elapsed().as_secs_f64());
        if let Some(error) = error {
            metrics
                .operation_errors_total
                .with_label_values(&[self.backend, self.operation, error.kind()])
                .inc();
        }
    }
}

/// Install the global tracing subscriber
///
/// Log lines are JSON objects. `RUST_LOG` overrides the default level of
/// `info` for this crate.
///
/// # Errors
/// `StoreError::Configuration` when a global subscriber is already set.
pub fn init_observability(default_directive: &str) -> Result<()> {
    #[cfg(feature = "metrics")]
    StoreMetrics::global();

    let directive = default_directive
        .parse()
        .map_err(|e| StoreError::configuration(format!("Invalid log directive '{default_directive}': {e}")))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(false);

    let subscriber = TracingRegistry::default()
        .with(EnvFilter::from_default_env().add_directive(directive))
        .with(fmt_layer);

    set_global_default(subscriber).map_err(|e| {
        StoreError::configuration(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::info!("stathive observability initialized");
    Ok(())
}

/// [`init_observability`] at `stathive_core=info`
pub fn init_default_observability() -> Result<()> {
    init_observability("stathive_core=info")
}
