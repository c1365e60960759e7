//! Prometheus Metrics Definitions
//!
//! Each orchestrator owns its own `Registry`, so several instances (and
//! tests) can live in one process without name collisions.

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};

use prism_core::{ConfigError, PrismError, PrismResult};

use crate::constants::{BUILD_LATENCY_BUCKETS, QUERY_LATENCY_BUCKETS};

/// Container for all PRISM metrics.
#[derive(Clone)]
pub struct OrchestratorMetrics {
    registry: Registry,

    /// Query counter - labels: route, source (hit/computed/coalesced/stale/bypassed)
    pub queries_total: CounterVec,

    /// Query duration histogram - labels: route
    pub query_duration_seconds: HistogramVec,

    /// Failed queries - labels: kind
    pub query_errors_total: CounterVec,

    /// Partition builds - labels: pre_aggregation, status
    pub builds_total: CounterVec,

    /// Partition build duration histogram - labels: pre_aggregation
    pub build_duration_seconds: HistogramVec,

    /// Entries currently held by the query cache
    pub cache_entries: IntGauge,
}

fn registration_error(name: &str, e: prometheus::Error) -> PrismError {
    ConfigError::InvalidValue {
        field: "metrics".to_string(),
        value: name.to_string(),
        reason: format!("Failed to register {}: {}", name, e),
    }
    .into()
}

impl OrchestratorMetrics {
    /// Create all metrics on a fresh registry.
    pub fn new() -> PrismResult<Self> {
        let registry = Registry::new();

        let queries_total = CounterVec::new(
            Opts::new("prism_queries_total", "Total number of executed queries"),
            &["route", "source"],
        )
        .map_err(|e| registration_error("prism_queries_total", e))?;

        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "prism_query_duration_seconds",
                "Query duration in seconds",
            )
            .buckets(QUERY_LATENCY_BUCKETS.to_vec()),
            &["route"],
        )
        .map_err(|e| registration_error("prism_query_duration_seconds", e))?;

        let query_errors_total = CounterVec::new(
            Opts::new("prism_query_errors_total", "Total number of failed queries"),
            &["kind"],
        )
        .map_err(|e| registration_error("prism_query_errors_total", e))?;

        let builds_total = CounterVec::new(
            Opts::new("prism_builds_total", "Total number of partition builds"),
            &["pre_aggregation", "status"],
        )
        .map_err(|e| registration_error("prism_builds_total", e))?;

        let build_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "prism_build_duration_seconds",
                "Partition build duration in seconds",
            )
            .buckets(BUILD_LATENCY_BUCKETS.to_vec()),
            &["pre_aggregation"],
        )
        .map_err(|e| registration_error("prism_build_duration_seconds", e))?;

        let cache_entries = IntGauge::new(
            "prism_cache_entries",
            "Current number of query cache entries",
        )
        .map_err(|e| registration_error("prism_cache_entries", e))?;

        registry
            .register(Box::new(queries_total.clone()))
            .map_err(|e| registration_error("prism_queries_total", e))?;
        registry
            .register(Box::new(query_duration_seconds.clone()))
            .map_err(|e| registration_error("prism_query_duration_seconds", e))?;
        registry
            .register(Box::new(query_errors_total.clone()))
            .map_err(|e| registration_error("prism_query_errors_total", e))?;
        registry
            .register(Box::new(builds_total.clone()))
            .map_err(|e| registration_error("prism_builds_total", e))?;
        registry
            .register(Box::new(build_duration_seconds.clone()))
            .map_err(|e| registration_error("prism_build_duration_seconds", e))?;
        registry
            .register(Box::new(cache_entries.clone()))
            .map_err(|e| registration_error("prism_cache_entries", e))?;

        Ok(Self {
            registry,
            queries_total,
            query_duration_seconds,
            query_errors_total,
            builds_total,
            build_duration_seconds,
            cache_entries,
        })
    }

    /// Record a successful query.
    pub fn record_query(&self, route: &str, source: &str, duration_secs: f64) {
        self.queries_total
            .with_label_values(&[route, source])
            .inc();
        self.query_duration_seconds
            .with_label_values(&[route])
            .observe(duration_secs);
    }

    /// Record a failed query.
    pub fn record_query_error(&self, error: &PrismError) {
        self.query_errors_total
            .with_label_values(&[error_kind(error)])
            .inc();
    }

    /// Record a partition build attempt.
    pub fn record_build(&self, pre_aggregation: &str, success: bool, duration_secs: f64) {
        let status = if success { "success" } else { "failure" };
        self.builds_total
            .with_label_values(&[pre_aggregation, status])
            .inc();
        self.build_duration_seconds
            .with_label_values(&[pre_aggregation])
            .observe(duration_secs);
    }

    pub fn set_cache_entries(&self, entries: usize) {
        self.cache_entries.set(entries as i64);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn gather_text(&self) -> PrismResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| registration_error("encode", e))?;
        String::from_utf8(buffer).map_err(|e| {
            ConfigError::Parse {
                reason: format!("Metrics output is not UTF-8: {}", e),
            }
            .into()
        })
    }
}

/// Metric label for an error.
pub fn error_kind(error: &PrismError) -> &'static str {
    match error {
        PrismError::Evaluation(_) => "evaluation",
        PrismError::Build(_) => "build",
        PrismError::Routing(_) => "routing",
        PrismError::Security(_) => "security",
        PrismError::Source(_) => "source",
        PrismError::Storage(_) => "storage",
        PrismError::Validation(_) => "validation",
        PrismError::Config(_) => "config",
    }
}
