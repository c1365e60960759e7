//! PRISM Orchestrator - Pre-Aggregation Refresh and Query Routing
//!
//! - [`PreAggregationRegistry`]: compiled rollups and per-partition build state
//! - [`BuildQueue`]: bounded, prioritized, coalescing partition builds
//! - [`RefreshScheduler`]: periodic refresh of stale partitions
//! - [`RollupRouter`]: raw / rollup / lambda routing
//! - [`QueryOrchestrator`]: the facade answering queries through the cache

pub mod builder;
pub mod constants;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod security;
pub mod telemetry;

pub use builder::{hydrate_registry, PartitionBuilder};
pub use orchestrator::{QueryOrchestrator, QueryOrchestratorBuilder, QueryRequest, QueryResponse};
pub use queue::{
    BuildExecutor, BuildHandle, BuildQueue, BuildQueueConfig, BuildQueueMetrics,
    BuildQueueSnapshot, BuildResult, QueueSnapshot, RetryPolicy,
};
pub use registry::{PartitionState, PreAggregationRegistry, RegistryEntrySnapshot};
pub use router::{execute_lambda, read_rollup, MissingPartitions, RollupRouter, Route, RouteKind};
pub use scheduler::{
    CycleReport, RefreshScheduler, SchedulerConfig, SchedulerHandle, SchedulerMetrics,
    SchedulerSnapshot,
};
pub use security::{
    AppIdResolver, AttributeAppId, DefaultAppId, PassThrough, RequireAttributes, RewriteChain,
    TenantFilter,
};
pub use telemetry::{init_tracing, OrchestratorMetrics, TelemetryConfig};
