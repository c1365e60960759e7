//! Pre-aggregation registry.
//!
//! Holds the compiled rollup descriptors and the build state of each of
//! their partitions. Descriptors are shared as `Arc` snapshots so routing
//! and scheduling never hold the registry lock across an await.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use prism_core::{
    BuildState, PartitionKey, PreAggregationDescriptor, PreAggregationId, QueryShape,
    RefreshKeyValue, TimeRange, Timestamp, ValidationError,
};
use serde::Serialize;

/// Build state of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionState {
    pub state: BuildState,
    /// Refresh key value of the last successful build.
    pub built_refresh_key: Option<RefreshKeyValue>,
    pub built_at: Option<Timestamp>,
    pub range: Option<TimeRange>,
}

impl PartitionState {
    fn absent(range: Option<TimeRange>) -> Self {
        Self {
            state: BuildState::Absent,
            built_refresh_key: None,
            built_at: None,
            range,
        }
    }

    /// Whether the stored data matches `refresh_key`.
    pub fn is_current(&self, refresh_key: &RefreshKeyValue) -> bool {
        self.state == BuildState::Built && self.built_refresh_key.as_ref() == Some(refresh_key)
    }

    /// Whether the partition has data that can be read.
    ///
    /// A rebuild keeps the previous data readable until it is replaced.
    pub fn is_servable(&self) -> bool {
        self.state.is_servable() || (self.state == BuildState::Building && self.built_at.is_some())
    }
}

/// Serializable view of one descriptor and its partitions.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryEntrySnapshot {
    pub id: PreAggregationId,
    pub state: BuildState,
    pub partitions: Vec<(PartitionKey, PartitionState)>,
}

struct Entry {
    descriptor: Arc<PreAggregationDescriptor>,
    partitions: BTreeMap<PartitionKey, PartitionState>,
}

impl Entry {
    fn new(descriptor: PreAggregationDescriptor) -> Self {
        let partitions = descriptor
            .partitions()
            .into_iter()
            .map(|p| (p.key, PartitionState::absent(p.range)))
            .collect();
        Self {
            descriptor: Arc::new(descriptor),
            partitions,
        }
    }

    fn aggregate_state(&self) -> BuildState {
        let states: Vec<BuildState> = self.partitions.values().map(|p| p.state).collect();
        if states.contains(&BuildState::Building) {
            BuildState::Building
        } else if !self.partitions.values().any(PartitionState::is_servable) {
            BuildState::Absent
        } else if states.iter().all(|s| *s == BuildState::Built) {
            BuildState::Built
        } else {
            BuildState::Stale
        }
    }
}

/// Descriptors that materialize the same rows.
fn same_materialization(a: &PreAggregationDescriptor, b: &PreAggregationDescriptor) -> bool {
    a.measures == b.measures
        && a.dimensions == b.dimensions
        && a.time_dimension == b.time_dimension
        && a.granularity == b.granularity
        && a.data_source == b.data_source
}

/// Registry of pre-aggregations and their build state.
#[derive(Default)]
pub struct PreAggregationRegistry {
    entries: RwLock<BTreeMap<PreAggregationId, Entry>>,
}

impl PreAggregationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<PreAggregationId, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<PreAggregationId, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the registered set.
    ///
    /// Every descriptor is validated first; on error nothing changes.
    /// Partitions that exist before and after keep their build state as long
    /// as the descriptor still materializes the same rows.
    pub fn register(
        &self,
        descriptors: Vec<PreAggregationDescriptor>,
    ) -> Result<(), ValidationError> {
        let mut seen = BTreeSet::new();
        for descriptor in &descriptors {
            descriptor.validate()?;
            if !seen.insert(descriptor.id.clone()) {
                return Err(ValidationError::InvalidValue {
                    field: "id".to_string(),
                    reason: format!("duplicate pre-aggregation {}", descriptor.id),
                });
            }
        }

        let mut entries = self.write();
        let mut next = BTreeMap::new();
        for descriptor in descriptors {
            let mut entry = Entry::new(descriptor);
            if let Some(previous) = entries.get(&entry.descriptor.id) {
                if same_materialization(&previous.descriptor, &entry.descriptor) {
                    for (key, state) in entry.partitions.iter_mut() {
                        if let Some(old) = previous.partitions.get(key) {
                            *state = old.clone();
                        }
                    }
                }
            }
            next.insert(entry.descriptor.id.clone(), entry);
        }
        let count = next.len();
        *entries = next;
        tracing::info!(pre_aggregations = count, "Pre-aggregations registered");
        Ok(())
    }

    pub fn get(&self, id: &PreAggregationId) -> Option<Arc<PreAggregationDescriptor>> {
        self.read().get(id).map(|e| Arc::clone(&e.descriptor))
    }

    /// All descriptors in id order.
    pub fn descriptors(&self) -> Vec<Arc<PreAggregationDescriptor>> {
        self.read()
            .values()
            .map(|e| Arc::clone(&e.descriptor))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Descriptors able to answer `query`, most specific first.
    ///
    /// A descriptor matches when it covers every cube, measure and required
    /// dimension of the query, can roll its time dimension up to the query's
    /// granularity over an aligned range, and its partitions cover the
    /// query range. Lambda descriptors only need to cover the start of the
    /// range, since the tail is read from the source.
    pub fn lookup(&self, query: &QueryShape) -> Vec<Arc<PreAggregationDescriptor>> {
        let mut matches: Vec<(u64, usize, Arc<PreAggregationDescriptor>)> = self
            .read()
            .values()
            .filter_map(|entry| {
                let d = &entry.descriptor;
                matches_query(d, query).map(|span| (span, d.dimensions.len(), Arc::clone(d)))
            })
            .collect();
        matches.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then_with(|| a.2.id.cmp(&b.2.id))
        });
        matches.into_iter().map(|(_, _, d)| d).collect()
    }

    /// Aggregate state of a descriptor.
    pub fn state(&self, id: &PreAggregationId) -> Option<BuildState> {
        self.read().get(id).map(Entry::aggregate_state)
    }

    pub fn partition_state(
        &self,
        id: &PreAggregationId,
        partition: &PartitionKey,
    ) -> Option<PartitionState> {
        self.read()
            .get(id)
            .and_then(|e| e.partitions.get(partition).cloned())
    }

    pub fn partition_states(&self, id: &PreAggregationId) -> Vec<(PartitionKey, PartitionState)> {
        self.read()
            .get(id)
            .map(|e| {
                e.partitions
                    .iter()
                    .map(|(k, s)| (k.clone(), s.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// End of the contiguous servable prefix of a partitioned descriptor.
    ///
    /// Data before the cutover can be read from the rollup; data after it
    /// must come from the source.
    pub fn built_cutover(&self, id: &PreAggregationId) -> Option<Timestamp> {
        let entries = self.read();
        let entry = entries.get(id)?;
        let mut cutover = None;
        for state in entry.partitions.values() {
            match (state.is_servable(), state.range) {
                (true, Some(range)) => cutover = Some(range.end),
                _ => break,
            }
        }
        cutover
    }

    fn update<F>(&self, id: &PreAggregationId, partition: &PartitionKey, f: F) -> bool
    where
        F: FnOnce(&mut PartitionState),
    {
        let mut entries = self.write();
        match entries
            .get_mut(id)
            .and_then(|e| e.partitions.get_mut(partition))
        {
            Some(state) => {
                f(state);
                true
            }
            None => false,
        }
    }

    /// Returns false when the partition is no longer registered.
    pub fn mark_building(&self, id: &PreAggregationId, partition: &PartitionKey) -> bool {
        self.update(id, partition, |s| s.state = BuildState::Building)
    }

    pub fn mark_built(
        &self,
        id: &PreAggregationId,
        partition: &PartitionKey,
        refresh_key: Option<RefreshKeyValue>,
        built_at: Timestamp,
    ) -> bool {
        self.update(id, partition, |s| {
            s.state = BuildState::Built;
            s.built_refresh_key = refresh_key;
            s.built_at = Some(built_at);
        })
    }

    /// Built data stays servable; never-built partitions stay absent.
    pub fn mark_stale(&self, id: &PreAggregationId, partition: &PartitionKey) -> bool {
        self.update(id, partition, |s| {
            if s.built_at.is_some() {
                s.state = BuildState::Stale;
            }
        })
    }

    /// Revert a failed build to the state its stored data allows.
    pub fn mark_failed(&self, id: &PreAggregationId, partition: &PartitionKey) -> bool {
        self.update(id, partition, |s| {
            s.state = if s.built_at.is_some() {
                BuildState::Stale
            } else {
                BuildState::Absent
            };
        })
    }

    pub fn snapshot(&self) -> Vec<RegistryEntrySnapshot> {
        self.read()
            .iter()
            .map(|(id, entry)| RegistryEntrySnapshot {
                id: id.clone(),
                state: entry.aggregate_state(),
                partitions: entry
                    .partitions
                    .iter()
                    .map(|(k, s)| (k.clone(), s.clone()))
                    .collect(),
            })
            .collect()
    }
}

/// Scan cost of answering `query` from `d`, or `None` when `d` cannot.
fn matches_query(d: &PreAggregationDescriptor, query: &QueryShape) -> Option<u64> {
    if d.data_source != query.data_source {
        return None;
    }
    if !query.cubes().is_subset(&d.dependent_cubes) {
        return None;
    }
    if !query.measures.iter().all(|m| d.measures.contains(m)) {
        return None;
    }
    if !query
        .required_dimensions()
        .iter()
        .all(|dim| d.dimensions.contains(dim))
    {
        return None;
    }

    if let Some(td) = &query.time_dimension {
        if d.time_dimension.as_deref() != Some(td.dimension.as_str()) {
            return None;
        }
        let rollup_granularity = d.granularity?;
        if let Some(g) = td.granularity {
            if !rollup_granularity.can_roll_up_to(g) {
                return None;
            }
        }
        if let Some(range) = &td.date_range {
            if !range.is_aligned_to(rollup_granularity) {
                return None;
            }
        }
    }

    let range = query.date_range();
    let Some(partitioning) = &d.partitioning else {
        return Some(u64::MAX);
    };
    let partitions = match (d.covering_partitions(range), range) {
        (Some(partitions), _) => partitions,
        (None, Some(range)) if d.lambda && partitioning.build_range.start <= range.start => {
            d.partitions_overlapping(range)
        }
        _ => return None,
    };
    let span: i64 = partitions
        .iter()
        .filter_map(|p| p.range)
        .map(|r| r.duration().num_seconds())
        .sum();
    Some(span.max(0) as u64)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use prism_core::{Granularity, Measure, TimeDimension};

    fn day(d: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn range(a: u32, b: u32) -> TimeRange {
        TimeRange::new(day(a), day(b)).unwrap()
    }

    fn daily(id: &str, build: TimeRange) -> PreAggregationDescriptor {
        PreAggregationDescriptor::new(id, "default")
            .with_measure(Measure::sum("orders.amount"))
            .with_dimension("orders.status")
            .with_time_dimension("orders.created_at", Granularity::Day)
            .with_partitioning(Granularity::Day, build)
    }

    fn query(range: TimeRange) -> QueryShape {
        QueryShape::new("default")
            .with_measure(Measure::sum("orders.amount"))
            .with_time_dimension(
                TimeDimension::new("orders.created_at")
                    .with_granularity(Granularity::Day)
                    .with_date_range(range),
            )
    }

    #[test]
    fn test_register_rejects_duplicates_and_invalid() {
        let registry = PreAggregationRegistry::new();
        let d = daily("orders.by_day", range(1, 8));
        assert!(registry.register(vec![d.clone(), d]).is_err());
        assert!(registry.is_empty());

        let invalid = PreAggregationDescriptor::new("orders.empty", "default");
        assert!(registry.register(vec![invalid]).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_orders_by_span_then_dimensions() {
        let registry = PreAggregationRegistry::new();
        let wide = daily("orders.wide", range(1, 31));
        let narrow = daily("orders.narrow", range(1, 8));
        let monthly = PreAggregationDescriptor::new("orders.total", "default")
            .with_measure(Measure::sum("orders.amount"))
            .with_time_dimension("orders.created_at", Granularity::Day);
        registry
            .register(vec![wide, narrow, monthly])
            .unwrap();

        let ids: Vec<String> = registry
            .lookup(&query(range(2, 4)))
            .iter()
            .map(|d| d.id.to_string())
            .collect();
        // Both partitioned rollups scan two days; the unpartitioned one scans everything.
        assert_eq!(ids, vec!["orders.narrow", "orders.wide", "orders.total"]);

        // Outside the narrow build range.
        let ids: Vec<String> = registry
            .lookup(&query(range(10, 12)))
            .iter()
            .map(|d| d.id.to_string())
            .collect();
        assert_eq!(ids, vec!["orders.wide", "orders.total"]);
    }

    #[test]
    fn test_lookup_requires_members_and_granularity() {
        let registry = PreAggregationRegistry::new();
        registry
            .register(vec![daily("orders.by_day", range(1, 8))])
            .unwrap();

        let unknown_measure = query(range(2, 4)).with_measure(Measure::count("orders.count"));
        assert!(registry.lookup(&unknown_measure).is_empty());

        let filtered_on_missing = query(range(2, 4)).with_filter(prism_core::Filter::equals(
            "orders.region",
            vec![serde_json::json!("eu")],
        ));
        assert!(registry.lookup(&filtered_on_missing).is_empty());

        let hourly = QueryShape::new("default")
            .with_measure(Measure::sum("orders.amount"))
            .with_time_dimension(
                TimeDimension::new("orders.created_at").with_granularity(Granularity::Hour),
            );
        assert!(registry.lookup(&hourly).is_empty());

        let unaligned = query(TimeRange::new(day(2) + Duration::hours(3), day(4)).unwrap());
        assert!(registry.lookup(&unaligned).is_empty());

        let other_source = QueryShape {
            data_source: "analytics".to_string(),
            ..query(range(2, 4))
        };
        assert!(registry.lookup(&other_source).is_empty());
    }

    #[test]
    fn test_lambda_only_needs_prefix_coverage() {
        let registry = PreAggregationRegistry::new();
        registry
            .register(vec![daily("orders.lambda", range(1, 8)).with_lambda(true)])
            .unwrap();
        assert_eq!(registry.lookup(&query(range(5, 12))).len(), 1);
        assert!(registry.lookup(&query(TimeRange::new(
            Utc.with_ymd_and_hms(2023, 12, 30, 0, 0, 0).unwrap(),
            day(3)
        )
        .unwrap()))
        .is_empty());
    }

    #[test]
    fn test_state_aggregation() {
        let registry = PreAggregationRegistry::new();
        let id = PreAggregationId::new("orders.by_day");
        registry
            .register(vec![daily("orders.by_day", range(1, 3))])
            .unwrap();
        let first = PartitionKey::for_start(day(1), Granularity::Day);
        let second = PartitionKey::for_start(day(2), Granularity::Day);

        assert_eq!(registry.state(&id), Some(BuildState::Absent));
        registry.mark_building(&id, &first);
        assert_eq!(registry.state(&id), Some(BuildState::Building));
        registry.mark_built(&id, &first, Some(RefreshKeyValue::Epoch(1)), day(3));
        assert_eq!(registry.state(&id), Some(BuildState::Stale));
        registry.mark_built(&id, &second, Some(RefreshKeyValue::Epoch(1)), day(3));
        assert_eq!(registry.state(&id), Some(BuildState::Built));

        registry.mark_stale(&id, &second);
        assert_eq!(registry.state(&id), Some(BuildState::Stale));
        registry.mark_building(&id, &second);
        registry.mark_failed(&id, &second);
        assert_eq!(
            registry.partition_state(&id, &second).unwrap().state,
            BuildState::Stale
        );
    }

    #[test]
    fn test_failed_first_build_reverts_to_absent() {
        let registry = PreAggregationRegistry::new();
        let id = PreAggregationId::new("orders.by_day");
        registry
            .register(vec![daily("orders.by_day", range(1, 2))])
            .unwrap();
        let key = PartitionKey::for_start(day(1), Granularity::Day);
        registry.mark_stale(&id, &key);
        assert_eq!(registry.state(&id), Some(BuildState::Absent));
        registry.mark_building(&id, &key);
        registry.mark_failed(&id, &key);
        assert_eq!(registry.state(&id), Some(BuildState::Absent));
    }

    #[test]
    fn test_built_cutover_is_end_of_contiguous_prefix() {
        let registry = PreAggregationRegistry::new();
        let id = PreAggregationId::new("orders.by_day");
        registry
            .register(vec![daily("orders.by_day", range(1, 5))])
            .unwrap();
        assert_eq!(registry.built_cutover(&id), None);

        for d in [1, 2, 4] {
            registry.mark_built(
                &id,
                &PartitionKey::for_start(day(d), Granularity::Day),
                None,
                day(5),
            );
        }
        assert_eq!(registry.built_cutover(&id), Some(day(3)));

        // Rebuilding a built partition does not move the cutover back.
        let second = PartitionKey::for_start(day(2), Granularity::Day);
        registry.mark_stale(&id, &second);
        registry.mark_building(&id, &second);
        assert!(registry.partition_state(&id, &second).unwrap().is_servable());
        assert_eq!(registry.built_cutover(&id), Some(day(3)));
    }

    #[test]
    fn test_reregister_keeps_state_of_unchanged_partitions() {
        let registry = PreAggregationRegistry::new();
        let id = PreAggregationId::new("orders.by_day");
        let key = PartitionKey::for_start(day(1), Granularity::Day);
        registry
            .register(vec![daily("orders.by_day", range(1, 3))])
            .unwrap();
        registry.mark_built(&id, &key, Some(RefreshKeyValue::Epoch(7)), day(3));

        // Build range grows; day 1 keeps its state.
        registry
            .register(vec![daily("orders.by_day", range(1, 5))])
            .unwrap();
        let state = registry.partition_state(&id, &key).unwrap();
        assert!(state.is_current(&RefreshKeyValue::Epoch(7)));
        assert_eq!(registry.partition_states(&id).len(), 4);

        // A different measure set invalidates the stored data.
        let changed = daily("orders.by_day", range(1, 5)).with_measure(Measure::count("orders.count"));
        registry.register(vec![changed]).unwrap();
        assert_eq!(
            registry.partition_state(&id, &key).unwrap().state,
            BuildState::Absent
        );
    }

    #[test]
    fn test_marks_on_unknown_partition_are_ignored() {
        let registry = PreAggregationRegistry::new();
        let id = PreAggregationId::new("missing");
        assert!(!registry.mark_building(&id, &PartitionKey::whole()));
        assert!(registry.snapshot().is_empty());
    }
}
