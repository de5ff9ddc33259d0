//! Metrics collection for observability
//!
//! Prometheus metrics on a private registry, so several ledgers can live in
//! one process (tests, embedding) without colliding in the default registry.
//!
//! # Metrics
//!
//! - `ledger_operations_total{operation,outcome}` - Engine calls by result
//! - `ledger_operation_duration_seconds{operation}` - Engine call latency
//! - `ledger_entries_written_total` - Committed entries
//! - `ledger_event_publish_failures_total` - Entry events that failed to publish

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Engine calls by operation and outcome (`ok` or an error kind)
    pub operations_total: IntCounterVec,

    /// Engine call latency
    pub operation_duration: HistogramVec,

    /// Committed entries
    pub entries_written: IntCounter,

    /// Failed entry event publications
    pub publish_failures: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let operations_total = IntCounterVec::new(
            Opts::new("ledger_operations_total", "Ledger operations by outcome"),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "ledger_operation_duration_seconds",
                "Ledger operation latency",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        let entries_written = IntCounter::new(
            "ledger_entries_written_total",
            "Total number of committed entries",
        )?;
        registry.register(Box::new(entries_written.clone()))?;

        let publish_failures = IntCounter::new(
            "ledger_event_publish_failures_total",
            "Entry events that could not be published",
        )?;
        registry.register(Box::new(publish_failures.clone()))?;

        Ok(Self {
            operations_total,
            operation_duration,
            entries_written,
            publish_failures,
            registry,
        })
    }

    /// Record one engine call
    pub fn record_operation<T>(&self, operation: &str, result: &crate::Result<T>, elapsed: Duration) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        self.operations_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.operation_duration
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    /// Record committed entries
    pub fn record_entries_written(&self, count: usize) {
        self.entries_written.inc_by(count as u64);
    }

    /// Record a failed event publication
    pub fn record_publish_failure(&self) {
        self.publish_failures.inc();
    }

    /// Calls recorded for `operation` with `outcome`
    pub fn operation_count(&self, operation: &str, outcome: &str) -> u64 {
        self.operations_total
            .with_label_values(&[operation, outcome])
            .get()
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the text exposition format
    pub fn gather_text(&self) -> crate::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| crate::Error::Config(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| crate::Error::Config(format!("Metrics output is not UTF-8: {}", e)))
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("entries_written", &self.entries_written.get())
            .field("publish_failures", &self.publish_failures.get())
            .finish_non_exhaustive()
    }
}
