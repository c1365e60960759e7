//! Query Orchestrator
//!
//! Entry point tying the pieces together:
//!
//! ```text
//! QueryRequest
//!   ├─→ QueryRewrite          (tenant filters, rejection)
//!   ├─→ Fingerprint + app id  (cache key)
//!   ├─→ RollupRouter          (raw / rollup / lambda)
//!   │     └─→ on-demand build of missing partitions, then re-route
//!   └─→ QueryCache            (coalesced, refresh-key versioned)
//! ```

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::future::{join_all, BoxFuture};
use prism_core::{
    BuildError, BuildJob, FilteredQuery, Fingerprint, JobKey, Partition,
    PreAggregationDescriptor, PreAggregationId, PrismConfig, PrismError, PrismResult,
    QueryResult, QueryRewrite, QueryShape, RefreshKeyContext, RefreshKeySpec, RefreshKeyValue,
    RoutingError, ScopedFingerprint, SecurityContext, Timestamp, BACKGROUND_PRIORITY,
    QUERY_PRIORITY,
};
use prism_storage::{
    CacheConfig, CacheStats, DriverRegistry, InMemoryRollupStore, QueryCache, ReadSource,
    RefreshKeyEvaluator, RollupStore, SourceDriver,
};
use tracing::Instrument;

use crate::builder::{hydrate_registry, PartitionBuilder};
use crate::queue::{BuildHandle, BuildQueue, BuildQueueConfig};
use crate::registry::PreAggregationRegistry;
use crate::router::{execute_lambda, read_rollup, MissingPartitions, RollupRouter, Route, RouteKind};
use crate::scheduler::{CycleReport, RefreshScheduler, SchedulerConfig, SchedulerHandle};
use crate::security::{AppIdResolver, DefaultAppId, PassThrough};
use crate::telemetry::OrchestratorMetrics;

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: QueryShape,
    pub context: SecurityContext,
    /// Skip the cache entirely.
    pub force_no_cache: bool,
    /// Recompute even when a matching cached result exists.
    pub renew: bool,
    /// Logical request time; the wall clock when unset.
    pub now: Option<Timestamp>,
}

impl QueryRequest {
    pub fn new(query: QueryShape, context: SecurityContext) -> Self {
        Self {
            query,
            context,
            force_no_cache: false,
            renew: false,
            now: None,
        }
    }

    pub fn with_force_no_cache(mut self, force: bool) -> Self {
        self.force_no_cache = force;
        self
    }

    pub fn with_renew(mut self, renew: bool) -> Self {
        self.renew = renew;
        self
    }

    pub fn at(mut self, now: Timestamp) -> Self {
        self.now = Some(now);
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub result: QueryResult,
    pub route: RouteKind,
    pub pre_aggregation: Option<PreAggregationId>,
    pub key: ScopedFingerprint,
    pub source: ReadSource,
    pub refresh_key: Option<RefreshKeyValue>,
    pub computed_at: Timestamp,
}

// ============================================================================
// BUILDER
// ============================================================================

pub struct QueryOrchestratorBuilder {
    config: PrismConfig,
    drivers: Arc<DriverRegistry>,
    store: Option<Arc<dyn RollupStore>>,
    rewrite: Arc<dyn QueryRewrite>,
    app_ids: Arc<dyn AppIdResolver>,
}

impl QueryOrchestratorBuilder {
    pub fn with_driver(self, driver: Arc<dyn SourceDriver>) -> Self {
        self.drivers.register(driver);
        self
    }

    pub fn with_drivers(mut self, drivers: Arc<DriverRegistry>) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RollupStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_rewrite(mut self, rewrite: impl QueryRewrite + 'static) -> Self {
        self.rewrite = Arc::new(rewrite);
        self
    }

    pub fn with_app_id_resolver(mut self, resolver: impl AppIdResolver + 'static) -> Self {
        self.app_ids = Arc::new(resolver);
        self
    }

    /// Validate the configuration and wire every component.
    pub fn build(self) -> PrismResult<QueryOrchestrator> {
        self.config.validate()?;
        let config = self.config;
        let metrics = OrchestratorMetrics::new()?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryRollupStore::new()) as Arc<dyn RollupStore>);
        let registry = Arc::new(PreAggregationRegistry::new());

        let cache_options = config.cache_options();
        let evaluator = Arc::new(
            RefreshKeyEvaluator::new(Arc::clone(&self.drivers))
                .with_global_renewal_threshold(cache_options.refresh_key_renewal_threshold),
        );
        let cache = QueryCache::new(Arc::clone(&evaluator), CacheConfig::from_options(cache_options));

        let builder = PartitionBuilder::new(
            Arc::clone(&registry),
            Arc::clone(&self.drivers),
            Arc::clone(&store),
        )
        .with_metrics(metrics.clone());
        let queue = BuildQueue::new(Arc::new(builder), BuildQueueConfig::from_config(&config));
        let scheduler = RefreshScheduler::new(
            Arc::clone(&registry),
            queue.clone(),
            Arc::clone(&evaluator),
            SchedulerConfig::from_config(&config),
        );
        let router = RollupRouter::new(Arc::clone(&registry), config.rollup_only_mode());

        tracing::info!(
            concurrency = queue.config().concurrency,
            external_refresh = config.external_refresh(),
            on_demand_refresh = config.on_demand_refresh(),
            rollup_only_mode = config.rollup_only_mode(),
            rewrite = self.rewrite.name(),
            "Query orchestrator ready"
        );

        Ok(QueryOrchestrator {
            config,
            drivers: self.drivers,
            store,
            rewrite: self.rewrite,
            app_ids: self.app_ids,
            registry,
            evaluator,
            queue,
            cache,
            router,
            scheduler,
            metrics,
        })
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct QueryOrchestrator {
    config: PrismConfig,
    drivers: Arc<DriverRegistry>,
    store: Arc<dyn RollupStore>,
    rewrite: Arc<dyn QueryRewrite>,
    app_ids: Arc<dyn AppIdResolver>,
    registry: Arc<PreAggregationRegistry>,
    evaluator: Arc<RefreshKeyEvaluator>,
    queue: BuildQueue,
    cache: QueryCache<QueryResult>,
    router: RollupRouter,
    scheduler: RefreshScheduler,
    metrics: OrchestratorMetrics,
}

impl QueryOrchestrator {
    pub fn builder(config: PrismConfig) -> QueryOrchestratorBuilder {
        QueryOrchestratorBuilder {
            config,
            drivers: Arc::new(DriverRegistry::new()),
            store: None,
            rewrite: Arc::new(PassThrough),
            app_ids: Arc::new(DefaultAppId::default()),
        }
    }

    pub fn config(&self) -> &PrismConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PreAggregationRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &BuildQueue {
        &self.queue
    }

    pub fn cache(&self) -> &QueryCache<QueryResult> {
        &self.cache
    }

    pub fn evaluator(&self) -> &Arc<RefreshKeyEvaluator> {
        &self.evaluator
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    pub fn metrics(&self) -> &OrchestratorMetrics {
        &self.metrics
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Replace the registered pre-aggregations.
    pub fn register_pre_aggregations(
        &self,
        descriptors: Vec<PreAggregationDescriptor>,
    ) -> PrismResult<()> {
        self.registry.register(descriptors)?;
        Ok(())
    }

    /// Mark partitions already present in the rollup store as built.
    pub async fn hydrate(&self) -> PrismResult<usize> {
        hydrate_registry(&self.registry, self.store.as_ref()).await
    }

    /// Start the periodic refresh scheduler.
    pub fn start_scheduler(&self) -> SchedulerHandle {
        self.scheduler.start()
    }

    pub async fn run_refresh_cycle(&self, now: Timestamp) -> CycleReport {
        self.scheduler.run_cycle(now).await
    }

    /// Bump a manual refresh trigger.
    pub fn signal(&self, trigger: &str) -> u64 {
        self.evaluator.signal(trigger)
    }

    /// Drop every cached result of one app.
    pub fn invalidate_app(&self, app_id: &str) -> usize {
        self.cache.invalidate_app(app_id)
    }

    /// Enqueue every partition of a pre-aggregation against its current
    /// refresh key.
    pub async fn build_pre_aggregation(
        &self,
        id: &PreAggregationId,
        now: Timestamp,
    ) -> PrismResult<Vec<BuildHandle>> {
        let descriptor = self
            .registry
            .get(id)
            .ok_or_else(|| RoutingError::UnknownPreAggregation {
                pre_aggregation: id.to_string(),
            })?;
        let partitions = descriptor.partitions();
        let priority = descriptor.priority.unwrap_or(BACKGROUND_PRIORITY);
        self.enqueue_partitions(&descriptor, &partitions, priority, now)
            .await
    }

    /// Stop accepting builds. Running builds finish on their own.
    pub fn shutdown(&self) {
        let dropped = self.queue.close();
        tracing::info!(dropped_builds = dropped, "Query orchestrator shut down");
    }

    /// Answer a query.
    pub async fn execute(&self, request: QueryRequest) -> PrismResult<QueryResponse> {
        let started = Instant::now();
        let span = tracing::info_span!(
            "prism.query",
            app_id = tracing::field::Empty,
            fingerprint = tracing::field::Empty,
            route = tracing::field::Empty,
        );
        let result = self.execute_inner(request).instrument(span).await;

        match &result {
            Ok(response) => self.metrics.record_query(
                response.route.as_str(),
                response.source.as_str(),
                started.elapsed().as_secs_f64(),
            ),
            Err(e) => {
                self.metrics.record_query_error(e);
                tracing::warn!(error = %e, "Query failed");
            }
        }
        self.metrics.set_cache_entries(self.cache.len());
        result
    }

    async fn execute_inner(&self, request: QueryRequest) -> PrismResult<QueryResponse> {
        let now = request.now.unwrap_or_else(Utc::now);
        let filtered = FilteredQuery::apply(request.query, self.rewrite.as_ref(), &request.context)?;
        let fingerprint = Fingerprint::of(&filtered);
        let key = ScopedFingerprint::new(self.app_ids.app_id(&request.context), fingerprint.clone());
        let query = filtered.into_shape();

        let span = tracing::Span::current();
        span.record("app_id", key.app_id());
        span.record("fingerprint", fingerprint.short());

        let route = self.route(&query, &fingerprint, now).await?;
        span.record("route", route.kind().as_str());

        let read = if request.force_no_cache {
            let answer = self.answer(&route, query)?;
            self.cache.force_no_cache(now, move || answer).await?
        } else if matches!(route, Route::Raw) && !request.renew {
            // Evaluated inside the cache so a failed evaluation can still
            // serve the last ready value.
            let context = RefreshKeyContext::new(now, query.data_source.clone());
            let answer = self.answer(&route, query)?;
            self.cache
                .get_or_compute(key.clone(), &self.source_refresh_key_spec(), &context, move || answer)
                .await?
        } else {
            let value = self.refresh_key(&route, &query, now).await?;
            let answer = self.answer(&route, query)?;
            if request.renew {
                self.cache.renew(key.clone(), value, now, move || answer).await?
            } else {
                self.cache
                    .get_or_compute_at(key.clone(), value, now, move || answer)
                    .await?
            }
        };

        tracing::debug!(source = read.source().as_str(), "Query answered");
        Ok(QueryResponse {
            route: route.kind(),
            pre_aggregation: route.pre_aggregation().map(|d| d.id.clone()),
            key,
            source: read.source(),
            refresh_key: read.refresh_key().cloned(),
            computed_at: read.computed_at(),
            result: read.into_value(),
        })
    }

    /// Route, building missing partitions first when allowed.
    async fn route(
        &self,
        query: &QueryShape,
        fingerprint: &Fingerprint,
        now: Timestamp,
    ) -> PrismResult<Route> {
        let routed = self.router.route(query, fingerprint);
        let unserved = matches!(
            routed,
            Ok(Route::Raw) | Err(RoutingError::NoMatchingRollup { .. })
        );
        if !unserved || !self.config.on_demand_refresh() {
            return Ok(routed?);
        }
        let Some(missing) = self.router.missing_partitions(query) else {
            return Ok(routed?);
        };

        self.build_on_demand(missing, now).await?;
        Ok(self.router.route(query, fingerprint)?)
    }

    /// Enqueue missing partitions at query priority and wait for them.
    ///
    /// Returns `ContinueWait` when they do not finish within the configured
    /// timeout; the builds keep running. Failed builds are logged and left to
    /// the re-route.
    async fn build_on_demand(&self, missing: MissingPartitions, now: Timestamp) -> PrismResult<()> {
        let descriptor = missing.pre_aggregation;
        tracing::info!(
            pre_aggregation = %descriptor.id,
            partitions = missing.partitions.len(),
            "Building missing partitions on demand"
        );
        let handles = self
            .enqueue_partitions(&descriptor, &missing.partitions, QUERY_PRIORITY, now)
            .await?;
        let first = handles
            .first()
            .map(|h| h.key().to_string())
            .unwrap_or_default();

        let waited = tokio::time::timeout(
            self.queue.config().continue_wait_timeout,
            join_all(handles.into_iter().map(BuildHandle::wait)),
        )
        .await;
        let Ok(results) = waited else {
            return Err(BuildError::ContinueWait { job: first }.into());
        };
        for error in results.into_iter().filter_map(Result::err) {
            tracing::warn!(
                pre_aggregation = %descriptor.id,
                error = %error,
                "On-demand build failed"
            );
        }
        Ok(())
    }

    async fn enqueue_partitions(
        &self,
        descriptor: &PreAggregationDescriptor,
        partitions: &[Partition],
        priority: i32,
        now: Timestamp,
    ) -> PrismResult<Vec<BuildHandle>> {
        let context = RefreshKeyContext::new(now, descriptor.data_source.clone());
        let value = self
            .evaluator
            .evaluate(&descriptor.refresh_key, &context)
            .await?;
        let mut handles = Vec::with_capacity(partitions.len());
        for partition in partitions {
            self.registry.mark_stale(&descriptor.id, &partition.key);
            let key = JobKey::new(descriptor.id.clone(), partition.key.clone());
            handles.push(
                self.queue
                    .enqueue(BuildJob::new(key, priority).with_refresh_key(value.clone()))?,
            );
        }
        Ok(handles)
    }

    fn source_refresh_key_spec(&self) -> RefreshKeySpec {
        RefreshKeySpec::every(self.config.cache_options().default_refresh_key_every_secs)
    }

    async fn source_refresh_key(
        &self,
        query: &QueryShape,
        now: Timestamp,
    ) -> PrismResult<RefreshKeyValue> {
        let context = RefreshKeyContext::new(now, query.data_source.clone());
        Ok(self
            .evaluator
            .evaluate(&self.source_refresh_key_spec(), &context)
            .await?)
    }

    /// Build versions of the partitions a route reads.
    fn partition_versions(
        &self,
        descriptor: &PreAggregationDescriptor,
        partitions: &[Partition],
    ) -> PrismResult<Vec<RefreshKeyValue>> {
        let mut versions = Vec::with_capacity(partitions.len() * 2);
        for partition in partitions {
            let state = self
                .registry
                .partition_state(&descriptor.id, &partition.key)
                .ok_or_else(|| RoutingError::PartitionMissing {
                    pre_aggregation: descriptor.id.to_string(),
                    partition: partition.key.to_string(),
                })?;
            versions.push(state.built_refresh_key.unwrap_or(RefreshKeyValue::Sequence(0)));
            versions.push(RefreshKeyValue::Epoch(
                state.built_at.map_or(0, |t| t.timestamp_millis()),
            ));
        }
        Ok(versions)
    }

    /// Data version of a routed query.
    ///
    /// Rollup reads change whenever one of their partitions is rebuilt.
    /// Lambda reads also depend on the cutover and the source.
    async fn refresh_key(
        &self,
        route: &Route,
        query: &QueryShape,
        now: Timestamp,
    ) -> PrismResult<RefreshKeyValue> {
        match route {
            Route::Raw => self.source_refresh_key(query, now).await,
            Route::Rollup {
                pre_aggregation,
                partitions,
            } => Ok(RefreshKeyValue::composite(
                &self.partition_versions(pre_aggregation, partitions)?,
            )),
            Route::Lambda {
                pre_aggregation,
                partitions,
                cutover,
            } => {
                let mut parts = self.partition_versions(pre_aggregation, partitions)?;
                parts.push(RefreshKeyValue::Epoch(cutover.timestamp_millis()));
                parts.push(self.source_refresh_key(query, now).await?);
                Ok(RefreshKeyValue::composite(&parts))
            }
        }
    }

    /// Owned future answering `query` over `route`. Nothing runs until it
    /// is polled.
    fn answer(
        &self,
        route: &Route,
        query: QueryShape,
    ) -> PrismResult<BoxFuture<'static, PrismResult<QueryResult>>> {
        let store = Arc::clone(&self.store);
        Ok(match route.clone() {
            Route::Raw => {
                let driver = self.drivers.get(&query.data_source)?;
                Box::pin(async move {
                    driver
                        .execute(&query, None)
                        .await
                        .map_err(PrismError::from)
                })
            }
            Route::Rollup {
                pre_aggregation,
                partitions,
            } => Box::pin(async move {
                read_rollup(store.as_ref(), &pre_aggregation, &partitions, &query).await
            }),
            Route::Lambda {
                pre_aggregation,
                partitions,
                cutover,
            } => {
                let driver = self.drivers.get(&query.data_source)?;
                Box::pin(async move {
                    execute_lambda(
                        store.as_ref(),
                        driver.as_ref(),
                        &pre_aggregation,
                        &partitions,
                        cutover,
                        &query,
                    )
                    .await
                })
            }
        })
    }
}
