//! Error types for PRISM operations

use thiserror::Error;

/// Refresh-key evaluation errors.
///
/// Non-fatal by contract: cached results stay servable until the next
/// successful evaluation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("Refresh key probe failed on {data_source}: {reason}")]
    ProbeFailed { data_source: String, reason: String },

    #[error("No source driver registered for data source {data_source}")]
    UnknownDataSource { data_source: String },

    #[error("Invalid refresh key: {reason}")]
    InvalidSpec { reason: String },
}

/// Build queue and partition build errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("Build of {job} failed after {attempts} attempts: {reason}")]
    Transient {
        job: String,
        attempts: u32,
        reason: String,
    },

    #[error("Build of {job} failed permanently: {reason}")]
    Fatal { job: String, reason: String },

    #[error("Build of {job} was cancelled before it started")]
    Cancelled { job: String },

    #[error("Local builds are disabled (external refresh); cannot build {job}")]
    RefreshDisabled { job: String },

    #[error("Build of {job} is still in progress, continue waiting")]
    ContinueWait { job: String },

    #[error("Build queue is closed")]
    QueueClosed,

    #[error("Priority {priority} is outside [-10000, 10000]")]
    InvalidPriority { priority: i32 },
}

/// Rollup routing errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("No built pre-aggregation matches query {fingerprint} (rollup-only mode)")]
    NoMatchingRollup { fingerprint: String },

    #[error("Pre-aggregation {pre_aggregation} is not registered")]
    UnknownPreAggregation { pre_aggregation: String },

    #[error("Partition {partition} of {pre_aggregation} is not built")]
    PartitionMissing {
        pre_aggregation: String,
        partition: String,
    },
}

/// Security context errors. Never cached.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecurityError {
    #[error("Query rejected: {reason}")]
    QueryRejected { reason: String },

    #[error("Security context is missing required attribute {attribute}")]
    MissingAttribute { attribute: String },
}

/// Errors reported by source drivers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Connection to {data_source} failed: {reason}")]
    Connection { data_source: String, reason: String },

    #[error("Query on {data_source} timed out after {timeout_ms}ms")]
    Timeout { data_source: String, timeout_ms: u64 },

    #[error("SQL error on {data_source}: {reason}")]
    Sql { data_source: String, reason: String },
}

/// Rollup storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Partition {partition} of {pre_aggregation} not found")]
    PartitionNotFound {
        pre_aggregation: String,
        partition: String,
    },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid time range: start {start} is after end {end}")]
    InvalidTimeRange { start: String, end: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all PRISM errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PrismError {
    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl PrismError {
    /// Whether a build that failed with this error may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PrismError::Source(SourceError::Connection { .. })
                | PrismError::Source(SourceError::Timeout { .. })
                | PrismError::Storage(StorageError::TransactionFailed { .. })
                | PrismError::Build(BuildError::Transient { .. })
        )
    }

    /// Rejections from the security layer must never be cached.
    pub fn is_rejection(&self) -> bool {
        matches!(self, PrismError::Security(_))
    }
}

/// Result type alias for PRISM operations.
pub type PrismResult<T> = Result<T, PrismError>;

// =============================================================================
// TESTS
// =============================================================================
