//! Query result caching.
//!
//! - [`RefreshKeyEvaluator`] turns a refresh key spec into a comparable value,
//!   probing data sources for SQL keys and reusing recent probes.
//! - [`QueryCache`] maps scoped fingerprints to results tagged with the
//!   refresh key value they were computed against, coalescing concurrent
//!   computations for the same fingerprint.

mod freshness;
mod query_cache;
mod refresh_key;
mod stats;

pub use freshness::{CacheRead, ReadSource};
pub use query_cache::{CacheConfig, LookupOptions, QueryCache};
pub use refresh_key::{EvaluatorMetrics, EvaluatorMetricsSnapshot, RefreshKeyEvaluator};
pub use stats::CacheStats;
