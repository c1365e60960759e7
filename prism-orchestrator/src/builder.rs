//! Partition builder.
//!
//! The [`BuildExecutor`] used by the orchestrator: runs a partition's build
//! query on its data source and writes the rows to the rollup store, keeping
//! the registry's partition state in step.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use prism_core::{BuildJob, PrismResult, RoutingError};
use prism_storage::{DriverRegistry, PartitionMeta, RollupStore};

use crate::queue::BuildExecutor;
use crate::registry::PreAggregationRegistry;
use crate::telemetry::OrchestratorMetrics;

pub struct PartitionBuilder {
    registry: Arc<PreAggregationRegistry>,
    drivers: Arc<DriverRegistry>,
    store: Arc<dyn RollupStore>,
    metrics: Option<OrchestratorMetrics>,
}

impl PartitionBuilder {
    pub fn new(
        registry: Arc<PreAggregationRegistry>,
        drivers: Arc<DriverRegistry>,
        store: Arc<dyn RollupStore>,
    ) -> Self {
        Self {
            registry,
            drivers,
            store,
            metrics: None,
        }
    }

    /// Record every attempt on `metrics`.
    pub fn with_metrics(mut self, metrics: OrchestratorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn build(&self, job: &BuildJob) -> PrismResult<usize> {
        let id = &job.key.pre_aggregation_id;
        let descriptor =
            self.registry
                .get(id)
                .ok_or_else(|| RoutingError::UnknownPreAggregation {
                    pre_aggregation: id.to_string(),
                })?;
        let partition = descriptor
            .partitions()
            .into_iter()
            .find(|p| p.key == job.key.partition)
            .ok_or_else(|| RoutingError::PartitionMissing {
                pre_aggregation: id.to_string(),
                partition: job.key.partition.to_string(),
            })?;

        self.registry.mark_building(id, &partition.key);
        let driver = match self.drivers.get(&descriptor.data_source) {
            Ok(driver) => driver,
            Err(e) => {
                self.registry.mark_failed(id, &partition.key);
                return Err(e.into());
            }
        };

        let query = descriptor.build_query(&partition);
        tracing::debug!(
            job = %job.key,
            attempt = job.attempt,
            sql = %driver.render_sql(&query),
            "Building partition"
        );

        let rows = match driver.execute(&query, partition.range).await {
            Ok(result) => result.rows,
            Err(e) => {
                self.registry.mark_failed(id, &partition.key);
                return Err(e.into());
            }
        };
        let rows_written = rows.len();
        let built_at = Utc::now();
        let meta = PartitionMeta {
            job_id: job.id,
            refresh_key: job.refresh_key.clone(),
            built_at,
            range: partition.range,
        };
        if let Err(e) = self
            .store
            .write_partition(id, &partition.key, rows, meta)
            .await
        {
            self.registry.mark_failed(id, &partition.key);
            return Err(e);
        }

        self.registry
            .mark_built(id, &partition.key, job.refresh_key.clone(), built_at);
        Ok(rows_written)
    }
}

#[async_trait]
impl BuildExecutor for PartitionBuilder {
    async fn execute(&self, job: &BuildJob) -> PrismResult<usize> {
        let started = Instant::now();
        let result = self.build(job).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_build(
                job.key.pre_aggregation_id.as_str(),
                result.is_ok(),
                started.elapsed().as_secs_f64(),
            );
        }
        result
    }
}

/// Seed partition state from what the store already holds.
///
/// Lets a restarted process serve rollups built before it started without
/// rebuilding them. Returns the number of partitions restored.
pub async fn hydrate_registry(
    registry: &PreAggregationRegistry,
    store: &dyn RollupStore,
) -> PrismResult<usize> {
    let mut restored = 0;
    for descriptor in registry.descriptors() {
        let registered = registry.partition_states(&descriptor.id);
        for key in store.list_partitions(&descriptor.id).await? {
            if !registered.iter().any(|(k, _)| *k == key) {
                continue;
            }
            if let Some(stored) = store.read_partition(&descriptor.id, &key).await? {
                registry.mark_built(
                    &descriptor.id,
                    &key,
                    stored.meta.refresh_key,
                    stored.meta.built_at,
                );
                restored += 1;
            }
        }
    }
    tracing::info!(partitions = restored, "Registry hydrated from rollup store");
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use prism_core::{
        BuildState, FactRow, Granularity, JobKey, Measure, PartitionKey,
        PreAggregationDescriptor, PreAggregationId, PrismError, RefreshKeyValue, TimeRange,
        Timestamp,
    };
    use prism_storage::{InMemoryRollupStore, InMemorySource, SourceDriver};

    fn day(d: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn setup() -> (
        Arc<PreAggregationRegistry>,
        Arc<InMemoryRollupStore>,
        PartitionBuilder,
    ) {
        let registry = Arc::new(PreAggregationRegistry::new());
        registry
            .register(vec![PreAggregationDescriptor::new("orders.by_day", "default")
                .with_measure(Measure::sum("orders.amount"))
                .with_time_dimension("orders.created_at", Granularity::Day)
                .with_partitioning(
                    Granularity::Day,
                    TimeRange::new(day(1), day(3)).unwrap(),
                )])
            .unwrap();
        let source = InMemorySource::new("default").with_facts(vec![
            FactRow::new(day(1)).with_value("orders.amount", 5.0),
            FactRow::new(day(2)).with_value("orders.amount", 7.0),
        ]);
        let drivers = Arc::new(
            DriverRegistry::new().with_driver(Arc::new(source) as Arc<dyn SourceDriver>),
        );
        let store = Arc::new(InMemoryRollupStore::new());
        let builder = PartitionBuilder::new(registry.clone(), drivers, store.clone());
        (registry, store, builder)
    }

    fn job(partition: PartitionKey) -> BuildJob {
        BuildJob::new(JobKey::new(PreAggregationId::new("orders.by_day"), partition), 0)
            .with_refresh_key(RefreshKeyValue::Epoch(1))
    }

    #[tokio::test]
    async fn test_build_writes_partition_and_marks_built() {
        let (registry, store, builder) = setup();
        let key = PartitionKey::for_start(day(1), Granularity::Day);
        let rows = builder.execute(&job(key.clone())).await.unwrap();
        assert_eq!(rows, 1);

        let id = PreAggregationId::new("orders.by_day");
        let stored = store.read_partition(&id, &key).await.unwrap().unwrap();
        assert_eq!(stored.rows[0].measures["orders.amount"], 5.0);
        assert_eq!(stored.meta.refresh_key, Some(RefreshKeyValue::Epoch(1)));

        let state = registry.partition_state(&id, &key).unwrap();
        assert!(state.is_current(&RefreshKeyValue::Epoch(1)));
    }

    #[tokio::test]
    async fn test_unknown_partition_is_fatal() {
        let (_registry, _store, builder) = setup();
        let err = builder
            .execute(&job(PartitionKey::parse("19990101")))
            .await
            .unwrap_err();
        assert!(matches!(err, PrismError::Routing(RoutingError::PartitionMissing { .. })));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_hydrate_restores_stored_partitions() {
        let (registry, store, builder) = setup();
        let key = PartitionKey::for_start(day(2), Granularity::Day);
        builder.execute(&job(key.clone())).await.unwrap();

        // Fresh registry over the same store.
        let fresh = PreAggregationRegistry::new();
        fresh
            .register(
                registry
                    .descriptors()
                    .iter()
                    .map(|d| (**d).clone())
                    .collect(),
            )
            .unwrap();
        let id = PreAggregationId::new("orders.by_day");
        assert_eq!(fresh.state(&id), Some(BuildState::Absent));

        let restored = hydrate_registry(&fresh, store.as_ref()).await.unwrap();
        assert_eq!(restored, 1);
        assert_eq!(fresh.state(&id), Some(BuildState::Stale));
        assert!(fresh
            .partition_state(&id, &key)
            .unwrap()
            .is_current(&RefreshKeyValue::Epoch(1)));
    }
}
