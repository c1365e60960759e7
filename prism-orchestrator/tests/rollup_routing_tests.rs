//! End-to-end routing through pre-aggregations: on-demand builds,
//! rollup-only mode, lambda reads, scheduled refresh and restart from a
//! persistent store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use futures_util::future::join_all;
use prism_core::{
    aggregate_facts, BuildState, PreAggregationDescriptor, PreAggregationId, PrismConfig,
    PrismError, RoutingError, SecurityContext, SourceError,
};
use prism_orchestrator::{BuildHandle, QueryOrchestrator, QueryRequest, RouteKind};
use prism_storage::{
    InMemoryRollupStore, InMemorySource, LmdbRollupStore, PartitionMeta, ReadSource, RollupStore,
};
use prism_test_utils::{day, days, fixtures, FlakySource, Granularity};

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn orders_id() -> PreAggregationId {
    PreAggregationId::new("orders.by_day")
}

fn orchestrator(config: PrismConfig, source: Arc<InMemorySource>) -> QueryOrchestrator {
    let orchestrator = QueryOrchestrator::builder(config)
        .with_driver(source)
        .build()
        .unwrap();
    orchestrator
        .register_pre_aggregations(vec![fixtures::orders_by_day(days(1, 15))])
        .unwrap();
    orchestrator
}

fn request(range: prism_core::TimeRange) -> QueryRequest {
    QueryRequest::new(fixtures::status_query(range), SecurityContext::new()).at(day(20))
}

async fn wait_all(handles: Vec<BuildHandle>) {
    for result in join_all(handles.into_iter().map(BuildHandle::wait)).await {
        result.unwrap();
    }
}

/// Poll until `expected` partitions of the orders rollup are built.
async fn wait_until_built(orchestrator: &QueryOrchestrator, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let built = orchestrator
            .registry()
            .partition_states(&orders_id())
            .iter()
            .filter(|(_, s)| s.state == BuildState::Built)
            .count();
        if built == expected {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "builds did not finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Write partitions `[from, to)` of `descriptor` straight into `store`.
async fn seed_store(
    store: &dyn RollupStore,
    descriptor: &PreAggregationDescriptor,
    from: u32,
    to: u32,
) {
    let facts = fixtures::orders_facts();
    for partition in descriptor.partitions() {
        let Some(range) = partition.range else { continue };
        if range.start < day(from) || range.end > day(to) {
            continue;
        }
        let rows = aggregate_facts(&facts, &descriptor.build_query(&partition)).rows;
        let meta = PartitionMeta {
            job_id: prism_core::new_id(),
            refresh_key: None,
            built_at: day(to),
            range: Some(range),
        };
        store
            .write_partition(&descriptor.id, &partition.key, rows, meta)
            .await
            .unwrap();
    }
}

// ============================================================================
// ON-DEMAND REFRESH
// ============================================================================

#[tokio::test]
async fn test_missing_partitions_built_on_demand_then_served_from_rollup() {
    let source = Arc::new(fixtures::orders_source());
    let orchestrator = orchestrator(PrismConfig::default(), source.clone());
    let range = days(2, 5);

    let response = orchestrator.execute(request(range)).await.unwrap();
    assert_eq!(response.route, RouteKind::Rollup);
    assert_eq!(response.pre_aggregation, Some(orders_id()));
    assert_eq!(
        response.result.sorted(),
        aggregate_facts(&fixtures::orders_facts(), &fixtures::status_query(range)).sorted()
    );
    // One build query per partition; the answer itself came from the store.
    assert_eq!(source.executions(), 3);

    let states = orchestrator.registry().partition_states(&orders_id());
    let built = states
        .iter()
        .filter(|(_, s)| s.state == BuildState::Built)
        .count();
    assert_eq!(built, 3);

    let again = orchestrator.execute(request(range)).await.unwrap();
    assert_eq!(again.source, ReadSource::Hit);
    assert_eq!(source.executions(), 3);
}

#[tokio::test]
async fn test_on_demand_disabled_answers_from_source() {
    let source = Arc::new(fixtures::orders_source());
    let orchestrator = orchestrator(
        PrismConfig::default().with_on_demand_refresh(false),
        source.clone(),
    );

    let response = orchestrator.execute(request(days(2, 5))).await.unwrap();
    assert_eq!(response.route, RouteKind::Raw);
    assert_eq!(source.executions(), 1);
    assert_eq!(orchestrator.queue().metrics().snapshot().enqueued, 0);
}

#[tokio::test]
async fn test_slow_on_demand_build_returns_continue_wait() {
    let source = Arc::new(fixtures::orders_source().with_latency(Duration::from_millis(1500)));
    let mut config = PrismConfig::default();
    config
        .orchestrator_options
        .query_cache_options
        .external_queue_options
        .continue_wait_timeout_secs = 1;
    let orchestrator = orchestrator(config, source);

    let err = orchestrator.execute(request(days(2, 3))).await.unwrap_err();
    assert!(matches!(
        err,
        PrismError::Build(prism_core::BuildError::ContinueWait { .. })
    ));
    assert!(orchestrator.queue().active_count() + orchestrator.queue().queued_count() > 0);
}

// ============================================================================
// ROLLUP-ONLY MODE
// ============================================================================

#[tokio::test]
async fn test_rollup_only_never_queries_the_source() {
    let source = Arc::new(fixtures::orders_source());
    let orchestrator = orchestrator(
        PrismConfig::default()
            .with_rollup_only_mode(true)
            .with_on_demand_refresh(false),
        source.clone(),
    );

    let err = orchestrator.execute(request(days(2, 5))).await.unwrap_err();
    assert!(matches!(
        err,
        PrismError::Routing(RoutingError::NoMatchingRollup { .. })
    ));

    // No rollup has the dimension at all.
    let unmatched = fixtures::status_query(days(2, 5)).with_dimension("orders.region");
    let err = orchestrator
        .execute(QueryRequest::new(unmatched, SecurityContext::new()).at(day(20)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PrismError::Routing(RoutingError::NoMatchingRollup { .. })
    ));
    assert_eq!(source.executions(), 0);
}

#[tokio::test]
async fn test_rollup_only_serves_once_built() {
    let source = Arc::new(fixtures::orders_source());
    let orchestrator = orchestrator(PrismConfig::default().with_rollup_only_mode(true), source);

    let response = orchestrator.execute(request(days(2, 5))).await.unwrap();
    assert_eq!(response.route, RouteKind::Rollup);
}

#[tokio::test]
async fn test_rollup_only_serves_previous_data_while_rebuilding() {
    let source = Arc::new(fixtures::orders_source().with_latency(Duration::from_millis(1000)));
    let store = Arc::new(InMemoryRollupStore::new());
    let descriptor = fixtures::orders_by_day(days(1, 15));
    seed_store(store.as_ref(), &descriptor, 1, 6).await;

    let orchestrator = QueryOrchestrator::builder(
        PrismConfig::default()
            .with_rollup_only_mode(true)
            .with_on_demand_refresh(false),
    )
    .with_driver(source)
    .with_store(store)
    .build()
    .unwrap();
    orchestrator
        .register_pre_aggregations(vec![descriptor])
        .unwrap();
    assert_eq!(orchestrator.hydrate().await.unwrap(), 5);

    // Seeded partitions carry no refresh key, so the cycle rebuilds them.
    let report = orchestrator.run_refresh_cycle(day(20)).await;
    assert!(report.jobs_enqueued >= 5);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let rebuilding = orchestrator
            .registry()
            .partition_states(&orders_id())
            .iter()
            .any(|(_, s)| s.state == BuildState::Building && s.built_at.is_some());
        if rebuilding {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no rebuild started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let range = days(1, 6);
    let response = orchestrator.execute(request(range)).await.unwrap();
    assert_eq!(response.route, RouteKind::Rollup);
    assert_eq!(
        response.result.sorted(),
        aggregate_facts(&fixtures::orders_facts(), &fixtures::status_query(range)).sorted()
    );
}

// ============================================================================
// LAMBDA
// ============================================================================

#[tokio::test]
async fn test_lambda_merges_rollup_and_source() {
    let source = Arc::new(fixtures::orders_source());
    let store = Arc::new(InMemoryRollupStore::new());
    let descriptor = fixtures::orders_by_day(days(1, 15)).with_lambda(true);
    seed_store(store.as_ref(), &descriptor, 1, 6).await;

    let orchestrator = QueryOrchestrator::builder(PrismConfig::default().with_on_demand_refresh(false))
        .with_driver(source.clone())
        .with_store(store)
        .build()
        .unwrap();
    orchestrator
        .register_pre_aggregations(vec![descriptor])
        .unwrap();
    assert_eq!(orchestrator.hydrate().await.unwrap(), 5);

    let query = fixtures::amount_query(days(3, 12), Granularity::Month);
    let response = orchestrator
        .execute(QueryRequest::new(query.clone(), SecurityContext::new()).at(day(20)))
        .await
        .unwrap();

    assert_eq!(response.route, RouteKind::Lambda);
    assert_eq!(response.result.rows.len(), 1);
    assert_eq!(
        response.result.sorted(),
        aggregate_facts(&fixtures::orders_facts(), &query).sorted()
    );
    assert_eq!(source.executions(), 1);
}

// ============================================================================
// SCHEDULED REFRESH
// ============================================================================

#[tokio::test]
async fn test_refresh_cycle_builds_then_rebuilds_on_new_key() {
    let source = Arc::new(fixtures::orders_source());
    let orchestrator = QueryOrchestrator::builder(PrismConfig::default())
        .with_driver(source.clone())
        .build()
        .unwrap();
    orchestrator
        .register_pre_aggregations(vec![fixtures::orders_by_day(days(1, 4))])
        .unwrap();
    let now = day(20);

    let report = orchestrator.run_refresh_cycle(now).await;
    assert_eq!(report.jobs_enqueued, 3);
    assert_eq!(report.errors, 0);
    wait_until_built(&orchestrator, 3).await;
    assert_eq!(source.executions(), 3);

    let report = orchestrator.run_refresh_cycle(now).await;
    assert_eq!(report.jobs_enqueued, 0);
    assert_eq!(report.up_to_date, 3);

    // The hourly key moves on: every partition is rebuilt once.
    let later = now + ChronoDuration::hours(2);
    let report = orchestrator.run_refresh_cycle(later).await;
    assert_eq!(report.jobs_enqueued, 3);
    wait_until_built(&orchestrator, 3).await;
    assert_eq!(source.executions(), 6);
    assert_eq!(orchestrator.run_refresh_cycle(later).await.up_to_date, 3);
}

#[tokio::test]
async fn test_external_refresh_never_builds() {
    let source = Arc::new(fixtures::orders_source());
    let orchestrator = orchestrator(PrismConfig::api_instance(), source.clone());

    let report = orchestrator.run_refresh_cycle(day(20)).await;
    assert_eq!(report.jobs_enqueued, 0);

    let response = orchestrator.execute(request(days(2, 5))).await.unwrap();
    assert_eq!(response.route, RouteKind::Raw);
    assert_eq!(source.executions(), 1);
}

// ============================================================================
// BUILD FAILURES
// ============================================================================

#[tokio::test]
async fn test_transient_build_failure_is_retried() {
    let flaky = Arc::new(FlakySource::new(fixtures::orders_source()));
    flaky.fail_next(1);
    let orchestrator = QueryOrchestrator::builder(PrismConfig::default())
        .with_driver(flaky.clone())
        .build()
        .unwrap();
    orchestrator
        .register_pre_aggregations(vec![fixtures::orders_by_day(days(1, 15))])
        .unwrap();

    let response = orchestrator.execute(request(days(2, 3))).await.unwrap();
    assert_eq!(response.route, RouteKind::Rollup);
    assert_eq!(flaky.inner().executions(), 1);
    assert_eq!(orchestrator.queue().metrics().snapshot().retries, 1);
}

#[tokio::test]
async fn test_fatal_build_failure_falls_back_to_source_error() {
    let flaky = Arc::new(FlakySource::new(fixtures::orders_source()));
    flaky.set_fatal(true);
    let orchestrator = QueryOrchestrator::builder(PrismConfig::default())
        .with_driver(flaky.clone())
        .build()
        .unwrap();
    orchestrator
        .register_pre_aggregations(vec![fixtures::orders_by_day(days(1, 15))])
        .unwrap();

    let err = orchestrator.execute(request(days(2, 3))).await.unwrap_err();
    assert!(matches!(err, PrismError::Source(SourceError::Sql { .. })));
    let (_, state) = orchestrator
        .registry()
        .partition_states(&orders_id())
        .into_iter()
        .find(|(_, s)| s.range.is_some_and(|r| r.start == day(2)))
        .unwrap();
    assert_eq!(state.state, BuildState::Absent);

    // Errors are not cached: the next attempt reaches the source again.
    flaky.set_fatal(false);
    let response = orchestrator.execute(request(days(2, 3))).await.unwrap();
    assert_eq!(response.route, RouteKind::Rollup);
}

// ============================================================================
// PERSISTENT STORE
// ============================================================================

#[tokio::test]
async fn test_lmdb_store_survives_registry_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn RollupStore> = Arc::new(LmdbRollupStore::new(dir.path(), 16).unwrap());
    let now = day(20);

    let source = Arc::new(fixtures::orders_source());
    let first = QueryOrchestrator::builder(PrismConfig::default())
        .with_driver(source.clone())
        .with_store(Arc::clone(&store))
        .build()
        .unwrap();
    first
        .register_pre_aggregations(vec![fixtures::orders_by_day(days(1, 4))])
        .unwrap();
    let handles = first.build_pre_aggregation(&orders_id(), now).await.unwrap();
    wait_all(handles).await;
    first.shutdown();

    let restarted_source = Arc::new(fixtures::orders_source());
    let second = QueryOrchestrator::builder(PrismConfig::default().with_on_demand_refresh(false))
        .with_driver(restarted_source.clone())
        .with_store(store)
        .build()
        .unwrap();
    second
        .register_pre_aggregations(vec![fixtures::orders_by_day(days(1, 4))])
        .unwrap();
    assert_eq!(second.hydrate().await.unwrap(), 3);

    let response = second.execute(request(days(1, 4))).await.unwrap();
    assert_eq!(response.route, RouteKind::Rollup);
    assert_eq!(
        response.result.sorted(),
        aggregate_facts(&fixtures::orders_facts(), &fixtures::status_query(days(1, 4))).sorted()
    );
    assert_eq!(restarted_source.executions(), 0);

    // Stored refresh keys count as current: nothing to rebuild.
    let report = second.run_refresh_cycle(now).await;
    assert_eq!(report.up_to_date, 3);
}
