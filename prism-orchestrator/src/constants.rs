//! Constants for the PRISM orchestrator.

// ============================================================================
// ROUTING
// ============================================================================

/// App id used when no resolver is configured.
pub const DEFAULT_APP_ID: &str = "STANDALONE";

/// Security context attribute read by `AttributeAppId` by default.
pub const DEFAULT_TENANT_ATTRIBUTE: &str = "tenantId";

// ============================================================================
// METRICS
// ============================================================================

/// Query latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
pub const QUERY_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Partition build latency buckets (seconds)
pub const BUILD_LATENCY_BUCKETS: &[f64] = &[0.010, 0.050, 0.100, 0.500, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0];
