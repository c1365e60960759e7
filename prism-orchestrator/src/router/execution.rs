//! Reading routed queries.

use prism_core::{
    merge_results, reaggregate, Partition, PreAggregationDescriptor, PrismError, PrismResult,
    QueryResult, QueryShape, RoutingError, Timestamp,
};
use prism_storage::{RollupStore, SourceDriver};

/// Answer `query` from stored partitions.
///
/// Every partition must be present in the store; a gap is reported as
/// `PartitionMissing` rather than returning a partial result.
pub async fn read_rollup(
    store: &dyn RollupStore,
    descriptor: &PreAggregationDescriptor,
    partitions: &[Partition],
    query: &QueryShape,
) -> PrismResult<QueryResult> {
    let mut rows = Vec::new();
    for partition in partitions {
        let stored = store
            .read_partition(&descriptor.id, &partition.key)
            .await?
            .ok_or_else(|| RoutingError::PartitionMissing {
                pre_aggregation: descriptor.id.to_string(),
                partition: partition.key.to_string(),
            })?;
        rows.extend(stored.rows);
    }
    Ok(reaggregate(&rows, query))
}

/// Answer `query` from the rollup below `cutover` and the source from
/// `cutover` on, merging groups that appear on both sides.
pub async fn execute_lambda(
    store: &dyn RollupStore,
    driver: &dyn SourceDriver,
    descriptor: &PreAggregationDescriptor,
    partitions: &[Partition],
    cutover: Timestamp,
    query: &QueryShape,
) -> PrismResult<QueryResult> {
    let Some(range) = query.date_range().copied() else {
        return read_rollup(store, descriptor, partitions, query).await;
    };
    let (lower, upper) = range.split_at(cutover);

    let historical = async {
        match lower {
            Some(lower) => {
                read_rollup(store, descriptor, partitions, &query.restricted_to(lower)).await
            }
            None => Ok(QueryResult::default()),
        }
    };
    let realtime = async {
        match upper {
            Some(upper) => driver
                .execute(&query.restricted_to(upper), Some(upper))
                .await
                .map_err(PrismError::from),
            None => Ok(QueryResult::default()),
        }
    };
    let (historical, realtime) = tokio::try_join!(historical, realtime)?;

    tracing::debug!(
        pre_aggregation = %descriptor.id,
        cutover = %cutover,
        rollup_rows = historical.rows.len(),
        source_rows = realtime.rows.len(),
        "Lambda halves merged"
    );
    Ok(merge_results(&historical, &realtime, query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use prism_core::{aggregate_facts, FactRow, Granularity, Measure, TimeDimension, TimeRange};
    use prism_storage::{InMemoryRollupStore, InMemorySource, PartitionMeta};

    fn day(d: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn facts() -> Vec<FactRow> {
        (1..=8)
            .flat_map(|d| {
                [
                    FactRow::new(day(d) + Duration::hours(2))
                        .with_dimension("orders.status", "paid")
                        .with_value("orders.amount", d as f64),
                    FactRow::new(day(d) + Duration::hours(20))
                        .with_dimension("orders.status", "open")
                        .with_value("orders.amount", 1.5),
                ]
            })
            .collect()
    }

    fn descriptor() -> PreAggregationDescriptor {
        PreAggregationDescriptor::new("orders.by_day", "default")
            .with_measure(Measure::sum("orders.amount"))
            .with_measure(Measure::count("orders.count"))
            .with_dimension("orders.status")
            .with_time_dimension("orders.created_at", Granularity::Day)
            .with_partitioning(Granularity::Day, TimeRange::new(day(1), day(9)).unwrap())
            .with_lambda(true)
    }

    async fn store_built(
        descriptor: &PreAggregationDescriptor,
        facts: &[FactRow],
        upto: Timestamp,
    ) -> (InMemoryRollupStore, Vec<Partition>) {
        let store = InMemoryRollupStore::new();
        let mut built = Vec::new();
        for partition in descriptor.partitions() {
            let Some(range) = partition.range else { continue };
            if range.end > upto {
                break;
            }
            let rows = aggregate_facts(facts, &descriptor.build_query(&partition)).rows;
            let meta = PartitionMeta {
                job_id: prism_core::new_id(),
                refresh_key: None,
                built_at: upto,
                range: Some(range),
            };
            store
                .write_partition(&descriptor.id, &partition.key, rows, meta)
                .await
                .unwrap();
            built.push(partition);
        }
        (store, built)
    }

    fn monthly_query(a: u32, b: u32) -> QueryShape {
        QueryShape::new("default")
            .with_measure(Measure::sum("orders.amount"))
            .with_measure(Measure::count("orders.count"))
            .with_time_dimension(
                TimeDimension::new("orders.created_at")
                    .with_granularity(Granularity::Month)
                    .with_date_range(TimeRange::new(day(a), day(b)).unwrap()),
            )
    }

    #[tokio::test]
    async fn test_read_rollup_reaggregates_to_query_shape() {
        let descriptor = descriptor();
        let facts = facts();
        let (store, built) = store_built(&descriptor, &facts, day(9)).await;
        let query = monthly_query(2, 5);
        let partitions: Vec<Partition> = built
            .into_iter()
            .filter(|p| p.range.is_some_and(|r| r.overlaps(query.date_range().unwrap())))
            .collect();

        let result = read_rollup(&store, &descriptor, &partitions, &query).await.unwrap();
        assert_eq!(result.sorted(), aggregate_facts(&facts, &query).sorted());
    }

    #[tokio::test]
    async fn test_read_rollup_reports_gap() {
        let descriptor = descriptor();
        let store = InMemoryRollupStore::new();
        let partitions = descriptor.partitions();
        let err = read_rollup(&store, &descriptor, &partitions[..1], &monthly_query(1, 2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            prism_core::PrismError::Routing(RoutingError::PartitionMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_lambda_matches_direct_aggregation() {
        let descriptor = descriptor();
        let facts = facts();
        let cutover = day(5);
        let (store, built) = store_built(&descriptor, &facts, cutover).await;
        let source = InMemorySource::new("default").with_facts(facts.clone());
        let query = monthly_query(2, 9);

        let lower = TimeRange::new(day(2), cutover).unwrap();
        let partitions = descriptor.partitions_overlapping(&lower);
        assert!(partitions.iter().all(|p| built.contains(p)));

        let merged = execute_lambda(&store, &source, &descriptor, &partitions, cutover, &query)
            .await
            .unwrap();
        let direct = aggregate_facts(&facts, &query);
        assert_eq!(merged.rows.len(), 1, "one month bucket, never duplicated");
        assert_eq!(merged.sorted(), direct.sorted());
        assert_eq!(source.executions(), 1);
    }
}
