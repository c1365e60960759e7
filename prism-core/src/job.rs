//! Build jobs.

use crate::error::BuildError;
use crate::preagg::{PartitionKey, PreAggregationId};
use crate::refresh::RefreshKeyValue;
use crate::{new_id, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Priority of builds triggered by an incoming query.
pub const QUERY_PRIORITY: i32 = 10;
/// Priority of builds triggered by the refresh scheduler.
pub const BACKGROUND_PRIORITY: i32 = 0;
pub const MIN_PRIORITY: i32 = -10_000;
pub const MAX_PRIORITY: i32 = 10_000;

/// Reject priorities outside `[MIN_PRIORITY, MAX_PRIORITY]`.
pub fn validate_priority(priority: i32) -> Result<i32, BuildError> {
    if (MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        Ok(priority)
    } else {
        Err(BuildError::InvalidPriority { priority })
    }
}

/// Identity of a build: at most one job per key is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub pre_aggregation_id: PreAggregationId,
    pub partition: PartitionKey,
}

impl JobKey {
    pub fn new(pre_aggregation_id: PreAggregationId, partition: PartitionKey) -> Self {
        Self {
            pre_aggregation_id,
            partition,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pre_aggregation_id, self.partition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: Uuid,
    pub key: JobKey,
    pub priority: i32,
    pub enqueued_at: Timestamp,
    /// Attempts started so far.
    pub attempt: u32,
    /// Refresh key value the partition is built against.
    pub refresh_key: Option<RefreshKeyValue>,
}

impl BuildJob {
    pub fn new(key: JobKey, priority: i32) -> Self {
        Self {
            id: new_id(),
            key,
            priority,
            enqueued_at: Utc::now(),
            attempt: 0,
            refresh_key: None,
        }
    }

    pub fn with_refresh_key(mut self, refresh_key: RefreshKeyValue) -> Self {
        self.refresh_key = Some(refresh_key);
        self
    }
}

/// Successful build outcome delivered to every waiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub key: JobKey,
    pub job_id: Uuid,
    pub rows_written: usize,
    pub refresh_key: Option<RefreshKeyValue>,
    pub built_at: Timestamp,
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_bounds() {
        assert_eq!(validate_priority(QUERY_PRIORITY), Ok(QUERY_PRIORITY));
        assert_eq!(validate_priority(MIN_PRIORITY), Ok(MIN_PRIORITY));
        assert!(validate_priority(MAX_PRIORITY + 1).is_err());
    }

    #[test]
    fn test_job_key_display() {
        let key = JobKey::new(PreAggregationId::new("orders.by_day"), PartitionKey::whole());
        assert_eq!(key.to_string(), "orders.by_day/whole");
    }

    #[test]
    fn test_job_ids_are_unique() {
        let key = JobKey::new(PreAggregationId::new("a"), PartitionKey::whole());
        let a = BuildJob::new(key.clone(), 0);
        let b = BuildJob::new(key, 0);
        assert_ne!(a.id, b.id);
        assert_eq!(a.attempt, 0);
    }
}
