//! In-memory reference backends.
//!
//! Used by tests and by embedders that keep their fact data in process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use prism_core::{
    aggregate_facts, FactRow, PartitionKey, PreAggregationId, PrismResult, QueryResult,
    QueryShape, ResultRow, ScalarValue, SourceError, TimeRange,
};
use serde_json::json;
use tokio::sync::RwLock;

use crate::backend::{PartitionMeta, RollupStore, SourceDriver, StoredPartition};

/// Source driver over a vector of fact rows.
///
/// Probes return an explicit value when one was set with
/// [`set_probe`](Self::set_probe), otherwise the current row count, so any
/// insert changes the data version.
pub struct InMemorySource {
    name: String,
    facts: RwLock<Vec<FactRow>>,
    probes: DashMap<String, ScalarValue>,
    latency: Option<Duration>,
    executions: AtomicU64,
    probe_calls: AtomicU64,
}

impl InMemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            facts: RwLock::new(Vec::new()),
            probes: DashMap::new(),
            latency: None,
            executions: AtomicU64::new(0),
            probe_calls: AtomicU64::new(0),
        }
    }

    pub fn with_facts(mut self, facts: Vec<FactRow>) -> Self {
        self.facts = RwLock::new(facts);
        self
    }

    /// Delay every execute and probe by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub async fn insert(&self, facts: impl IntoIterator<Item = FactRow>) {
        self.facts.write().await.extend(facts);
    }

    pub async fn fact_count(&self) -> usize {
        self.facts.read().await.len()
    }

    /// Pin the value returned for a probe SQL string.
    pub fn set_probe(&self, sql: impl Into<String>, value: ScalarValue) {
        self.probes.insert(sql.into(), value);
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn probe_calls(&self) -> u64 {
        self.probe_calls.load(Ordering::Relaxed)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl SourceDriver for InMemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe_refresh_value(&self, sql: &str) -> Result<ScalarValue, SourceError> {
        self.probe_calls.fetch_add(1, Ordering::Relaxed);
        self.delay().await;
        if let Some(value) = self.probes.get(sql) {
            return Ok(value.clone());
        }
        Ok(json!(self.facts.read().await.len()))
    }

    async fn execute(
        &self,
        query: &QueryShape,
        range: Option<TimeRange>,
    ) -> Result<QueryResult, SourceError> {
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.delay().await;
        let effective = match range {
            Some(r) => query.restricted_to(r),
            None => query.clone(),
        };
        let facts = self.facts.read().await;
        Ok(aggregate_facts(&facts, &effective))
    }
}

/// Rollup store backed by a concurrent map.
#[derive(Default)]
pub struct InMemoryRollupStore {
    partitions: DashMap<(PreAggregationId, PartitionKey), StoredPartition>,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl InMemoryRollupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RollupStore for InMemoryRollupStore {
    async fn read_partition(
        &self,
        id: &PreAggregationId,
        partition: &PartitionKey,
    ) -> PrismResult<Option<StoredPartition>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .partitions
            .get(&(id.clone(), partition.clone()))
            .map(|p| p.value().clone()))
    }

    async fn write_partition(
        &self,
        id: &PreAggregationId,
        partition: &PartitionKey,
        rows: Vec<ResultRow>,
        meta: PartitionMeta,
    ) -> PrismResult<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.partitions
            .insert((id.clone(), partition.clone()), StoredPartition { rows, meta });
        Ok(())
    }

    async fn drop_partition(
        &self,
        id: &PreAggregationId,
        partition: &PartitionKey,
    ) -> PrismResult<bool> {
        Ok(self
            .partitions
            .remove(&(id.clone(), partition.clone()))
            .is_some())
    }

    async fn list_partitions(&self, id: &PreAggregationId) -> PrismResult<Vec<PartitionKey>> {
        let mut keys: Vec<PartitionKey> = self
            .partitions
            .iter()
            .filter(|e| &e.key().0 == id)
            .map(|e| e.key().1.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
