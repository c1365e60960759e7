//! PRISM Telemetry - Observability Infrastructure
//!
//! Structured logging through `tracing` and per-instance Prometheus metrics.

pub mod metrics;
pub mod tracer;

pub use metrics::{error_kind, OrchestratorMetrics};
pub use tracer::{init_tracing, TelemetryConfig};
