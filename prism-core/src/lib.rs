//! PRISM Core - Data Model
//!
//! Types shared by every PRISM crate: the logical query model, fingerprints,
//! refresh keys, pre-aggregation descriptors, build jobs, configuration and
//! the error taxonomy. Nothing in here performs I/O.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod aggregate;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod job;
pub mod preagg;
pub mod query;
pub mod refresh;
pub mod security;
pub mod time;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 (timestamp-sortable).
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

pub use aggregate::{aggregate_facts, merge_results, reaggregate};
pub use config::{
    ExternalQueueOptions, OrchestratorOptions, PreAggregationsOptions, PrismConfig,
    QueryCacheOptions, DEFAULT_CONCURRENCY, DEFAULT_EXPIRE_SECS, DEFAULT_REFRESH_KEY_EVERY_SECS,
    DEFAULT_RENEWAL_THRESHOLD_SECS,
};
pub use error::{
    BuildError, ConfigError, EvaluationError, PrismError, PrismResult, RoutingError,
    SecurityError, SourceError, StorageError, ValidationError,
};
pub use fingerprint::{FilteredQuery, Fingerprint, ScopedFingerprint};
pub use job::{
    validate_priority, BuildJob, BuildOutput, JobKey, BACKGROUND_PRIORITY, MAX_PRIORITY,
    MIN_PRIORITY, QUERY_PRIORITY,
};
pub use preagg::{
    BuildState, Partition, PartitionKey, Partitioning, PreAggregationDescriptor,
    PreAggregationId,
};
pub use query::{
    cube_of, Aggregation, FactRow, Filter, FilterOperator, Measure, QueryResult, QueryShape,
    ResultRow, ScalarValue, TimeDimension,
};
pub use refresh::{RefreshKeyContext, RefreshKeySpec, RefreshKeyValue};
pub use security::{QueryRewrite, SecurityContext};
pub use time::{Granularity, TimeRange};
