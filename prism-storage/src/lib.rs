//! PRISM Storage - Sources, Rollups and the Query Cache
//!
//! Provides the I/O seams of PRISM:
//!
//! - [`SourceDriver`]: executes logical queries and refresh key probes
//!   against a data source.
//! - [`RollupStore`]: persists built pre-aggregation partitions, with an
//!   in-memory and an LMDB implementation.
//! - [`cache`]: refresh key evaluation and the coalescing query cache.

pub mod backend;
pub mod cache;
pub mod lmdb_store;
pub mod memory;

pub use backend::{
    render_ansi_sql, DriverRegistry, PartitionMeta, RollupStore, SourceDriver, StoredPartition,
};
pub use cache::{
    CacheConfig, CacheRead, CacheStats, EvaluatorMetrics, EvaluatorMetricsSnapshot, LookupOptions,
    QueryCache, ReadSource, RefreshKeyEvaluator,
};
pub use lmdb_store::{LmdbRollupStore, LmdbStoreError};
pub use memory::{InMemoryRollupStore, InMemorySource};
