//! Pre-aggregation descriptors and partitions.

use crate::error::ValidationError;
use crate::job::{MAX_PRIORITY, MIN_PRIORITY};
use crate::query::{Measure, QueryShape, TimeDimension};
use crate::refresh::RefreshKeySpec;
use crate::time::{Granularity, TimeRange};
use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Pre-aggregation identifier (`cube.rollup_name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PreAggregationId(pub String);

impl PreAggregationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PreAggregationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PreAggregationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

const WHOLE_PARTITION: &str = "whole";

/// Partition suffix: `YYYYMMDD`, `YYYYMMDDHH` for sub-day partitions, or
/// `whole` for unpartitioned rollups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn whole() -> Self {
        Self(WHOLE_PARTITION.to_string())
    }

    pub fn for_start(start: Timestamp, granularity: Granularity) -> Self {
        let format = if granularity.is_sub_day() {
            "%Y%m%d%H"
        } else {
            "%Y%m%d"
        };
        Self(start.format(format).to_string())
    }

    /// Rebuild a key from its stored string form.
    pub fn parse(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn is_whole(&self) -> bool {
        self.0 == WHOLE_PARTITION
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One physical slice of a rollup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub key: PartitionKey,
    /// `None` for the single partition of an unpartitioned rollup.
    pub range: Option<TimeRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partitioning {
    pub granularity: Granularity,
    pub build_range: TimeRange,
}

/// Build state of a partition, or of a whole descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Absent,
    Building,
    Stale,
    Built,
}

impl BuildState {
    /// Built or Stale data may be read.
    pub fn is_servable(self) -> bool {
        matches!(self, BuildState::Built | BuildState::Stale)
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildState::Absent => "absent",
            BuildState::Building => "building",
            BuildState::Stale => "stale",
            BuildState::Built => "built",
        };
        f.write_str(s)
    }
}

/// Rollup definition as produced by schema compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreAggregationDescriptor {
    pub id: PreAggregationId,
    pub dependent_cubes: BTreeSet<String>,
    pub measures: Vec<Measure>,
    pub dimensions: BTreeSet<String>,
    pub time_dimension: Option<String>,
    pub granularity: Option<Granularity>,
    pub refresh_key: RefreshKeySpec,
    pub partitioning: Option<Partitioning>,
    pub external_storage: bool,
    /// Never refreshed by the background scheduler.
    pub rollup_only: bool,
    /// Union with real-time source data above the built range.
    pub lambda: bool,
    /// Only partitions overlapping `[now - update_window, now)` are
    /// rebuilt once they exist.
    pub update_window: Option<Duration>,
    pub data_source: String,
    pub priority: Option<i32>,
}

impl PreAggregationDescriptor {
    pub fn new(id: impl Into<String>, data_source: impl Into<String>) -> Self {
        Self {
            id: PreAggregationId::new(id),
            dependent_cubes: BTreeSet::new(),
            measures: Vec::new(),
            dimensions: BTreeSet::new(),
            time_dimension: None,
            granularity: None,
            refresh_key: RefreshKeySpec::every(crate::DEFAULT_REFRESH_KEY_EVERY_SECS),
            partitioning: None,
            external_storage: false,
            rollup_only: false,
            lambda: false,
            update_window: None,
            data_source: data_source.into(),
            priority: None,
        }
    }

    pub fn with_measure(mut self, measure: Measure) -> Self {
        self.dependent_cubes
            .insert(crate::query::cube_of(&measure.name).to_string());
        self.measures.push(measure);
        self
    }

    pub fn with_dimension(mut self, dimension: impl Into<String>) -> Self {
        let dimension = dimension.into();
        self.dependent_cubes
            .insert(crate::query::cube_of(&dimension).to_string());
        self.dimensions.insert(dimension);
        self
    }

    pub fn with_time_dimension(mut self, dimension: impl Into<String>, granularity: Granularity) -> Self {
        let dimension = dimension.into();
        self.dependent_cubes
            .insert(crate::query::cube_of(&dimension).to_string());
        self.time_dimension = Some(dimension);
        self.granularity = Some(granularity);
        self
    }

    pub fn with_refresh_key(mut self, refresh_key: RefreshKeySpec) -> Self {
        self.refresh_key = refresh_key;
        self
    }

    pub fn with_partitioning(mut self, granularity: Granularity, build_range: TimeRange) -> Self {
        self.partitioning = Some(Partitioning {
            granularity,
            build_range,
        });
        self
    }

    pub fn with_lambda(mut self, lambda: bool) -> Self {
        self.lambda = lambda;
        self
    }

    pub fn with_rollup_only(mut self, rollup_only: bool) -> Self {
        self.rollup_only = rollup_only;
        self
    }

    pub fn with_update_window(mut self, window: Duration) -> Self {
        self.update_window = Some(window);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_external_storage(mut self, external: bool) -> Self {
        self.external_storage = external;
        self
    }

    /// All partitions in time order.
    pub fn partitions(&self) -> Vec<Partition> {
        match &self.partitioning {
            None => vec![Partition {
                key: PartitionKey::whole(),
                range: None,
            }],
            Some(p) => p
                .build_range
                .buckets(p.granularity)
                .into_iter()
                .map(|range| Partition {
                    key: PartitionKey::for_start(range.start, p.granularity),
                    range: Some(range),
                })
                .collect(),
        }
    }

    /// Partitions needed to answer a query over `range`.
    ///
    /// Returns `None` when the build range does not cover the query range.
    /// A query without a range reads every partition.
    pub fn covering_partitions(&self, range: Option<&TimeRange>) -> Option<Vec<Partition>> {
        let Some(partitioning) = &self.partitioning else {
            return Some(self.partitions());
        };
        let Some(range) = range else {
            return Some(self.partitions());
        };
        if !partitioning.build_range.covers(range) {
            return None;
        }
        Some(
            self.partitions()
                .into_iter()
                .filter(|p| p.range.is_some_and(|r| r.overlaps(range)))
                .collect(),
        )
    }

    /// Partitions overlapping `[start, end)` of a lambda query, ignoring
    /// build range coverage.
    pub fn partitions_overlapping(&self, range: &TimeRange) -> Vec<Partition> {
        self.partitions()
            .into_iter()
            .filter(|p| p.range.map_or(true, |r| r.overlaps(range)))
            .collect()
    }

    /// Query that materializes one partition.
    pub fn build_query(&self, partition: &Partition) -> QueryShape {
        let mut query = QueryShape::new(self.data_source.clone());
        query.measures = self.measures.clone();
        query.dimensions = self.dimensions.iter().cloned().collect();
        query.time_dimension = self.time_dimension.as_ref().map(|dim| TimeDimension {
            dimension: dim.clone(),
            granularity: self.granularity,
            date_range: partition.range,
        });
        query
    }

    /// Structural checks a compiled descriptor must satisfy.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.as_str().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "id".to_string(),
            });
        }
        if self.measures.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: format!("{}.measures", self.id),
            });
        }
        if self.granularity.is_some() != self.time_dimension.is_some() {
            return Err(ValidationError::InvalidValue {
                field: format!("{}.granularity", self.id),
                reason: "time dimension and granularity must be set together".to_string(),
            });
        }
        if let Some(p) = &self.partitioning {
            let Some(granularity) = self.granularity else {
                return Err(ValidationError::RequiredFieldMissing {
                    field: format!("{}.time_dimension", self.id),
                });
            };
            if !granularity.can_roll_up_to(p.granularity) {
                return Err(ValidationError::InvalidValue {
                    field: format!("{}.partitioning.granularity", self.id),
                    reason: format!(
                        "partition granularity {} is finer than rollup granularity {}",
                        p.granularity, granularity
                    ),
                });
            }
            if p.build_range.is_empty() {
                return Err(ValidationError::InvalidValue {
                    field: format!("{}.partitioning.build_range", self.id),
                    reason: "build range is empty".to_string(),
                });
            }
        }
        if (self.lambda || self.update_window.is_some()) && self.partitioning.is_none() {
            return Err(ValidationError::InvalidValue {
                field: format!("{}.partitioning", self.id),
                reason: "lambda and update window require a partitioned rollup".to_string(),
            });
        }
        if let Some(priority) = self.priority {
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
                return Err(ValidationError::InvalidValue {
                    field: format!("{}.priority", self.id),
                    reason: format!("{} is outside [{}, {}]", priority, MIN_PRIORITY, MAX_PRIORITY),
                });
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn day(d: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn daily() -> PreAggregationDescriptor {
        PreAggregationDescriptor::new("orders.by_day", "default")
            .with_measure(Measure::sum("orders.amount"))
            .with_dimension("orders.status")
            .with_time_dimension("orders.created_at", Granularity::Day)
            .with_partitioning(Granularity::Day, TimeRange::new(day(1), day(8)).unwrap())
    }

    #[test]
    fn test_partition_keys() {
        let parts = daily().partitions();
        assert_eq!(parts.len(), 7);
        assert_eq!(parts[0].key.as_str(), "20240101");
        assert_eq!(parts[6].key.as_str(), "20240107");

        let hourly = PartitionKey::for_start(day(2) + chrono::Duration::hours(5), Granularity::Hour);
        assert_eq!(hourly.as_str(), "2024010205");
    }

    #[test]
    fn test_unpartitioned_has_single_whole_partition() {
        let d = PreAggregationDescriptor::new("orders.total", "default")
            .with_measure(Measure::count("orders.count"));
        let parts = d.partitions();
        assert_eq!(parts.len(), 1);
        assert!(parts[0].key.is_whole());
        assert!(parts[0].range.is_none());
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_covering_partitions() {
        let d = daily();
        let covered = d
            .covering_partitions(Some(&TimeRange::new(day(2), day(4)).unwrap()))
            .unwrap();
        assert_eq!(covered.len(), 2);

        assert!(d
            .covering_partitions(Some(&TimeRange::new(day(6), day(10)).unwrap()))
            .is_none());
    }

    #[test]
    fn test_build_query_targets_partition() {
        let d = daily();
        let partition = &d.partitions()[3];
        let q = d.build_query(partition);
        assert_eq!(q.date_range(), partition.range.as_ref());
        assert_eq!(q.granularity(), Some(Granularity::Day));
        assert_eq!(q.dimensions, vec!["orders.status".to_string()]);
    }

    #[test]
    fn test_validate_rejects_bad_descriptors() {
        let no_measures = PreAggregationDescriptor::new("x", "default");
        assert!(no_measures.validate().is_err());

        let lambda_unpartitioned = PreAggregationDescriptor::new("x", "default")
            .with_measure(Measure::count("orders.count"))
            .with_lambda(true);
        assert!(lambda_unpartitioned.validate().is_err());

        let finer_partitions = PreAggregationDescriptor::new("x", "default")
            .with_measure(Measure::count("orders.count"))
            .with_time_dimension("orders.created_at", Granularity::Day)
            .with_partitioning(Granularity::Hour, TimeRange::new(day(1), day(2)).unwrap());
        assert!(finer_partitions.validate().is_err());

        let bad_priority = daily().with_priority(20_000);
        assert!(bad_priority.validate().is_err());

        assert!(daily().validate().is_ok());
    }

    #[test]
    fn test_servable_states() {
        assert!(BuildState::Built.is_servable());
        assert!(BuildState::Stale.is_servable());
        assert!(!BuildState::Building.is_servable());
        assert!(!BuildState::Absent.is_servable());
    }
}
