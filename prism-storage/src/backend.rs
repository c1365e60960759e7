//! Backend capability traits.
//!
//! A deployment plugs in one [`SourceDriver`] per data source and one
//! [`RollupStore`]. Nothing here knows about a specific database.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use prism_core::{
    Aggregation, EvaluationError, FilterOperator, PartitionKey, PreAggregationId, PrismResult,
    QueryResult, QueryShape, RefreshKeyValue, ResultRow, ScalarValue, SourceError, TimeRange,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Data source driver.
#[async_trait]
pub trait SourceDriver: Send + Sync {
    /// Data source name this driver serves.
    fn name(&self) -> &str;

    /// Render `query` in the driver's SQL dialect.
    fn render_sql(&self, query: &QueryShape) -> String {
        render_ansi_sql(query)
    }

    /// Run a refresh key probe and return its scalar result.
    async fn probe_refresh_value(&self, sql: &str) -> Result<ScalarValue, SourceError>;

    /// Execute `query`, restricted to `range` when given.
    async fn execute(
        &self,
        query: &QueryShape,
        range: Option<TimeRange>,
    ) -> Result<QueryResult, SourceError>;
}

/// Metadata stored next to a partition's rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub job_id: Uuid,
    pub refresh_key: Option<RefreshKeyValue>,
    pub built_at: Timestamp,
    pub range: Option<TimeRange>,
}

/// A materialized partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPartition {
    pub rows: Vec<ResultRow>,
    pub meta: PartitionMeta,
}

/// Durable rollup storage, addressed by (pre-aggregation, partition).
#[async_trait]
pub trait RollupStore: Send + Sync {
    async fn read_partition(
        &self,
        id: &PreAggregationId,
        partition: &PartitionKey,
    ) -> PrismResult<Option<StoredPartition>>;

    /// Replace the partition atomically.
    async fn write_partition(
        &self,
        id: &PreAggregationId,
        partition: &PartitionKey,
        rows: Vec<ResultRow>,
        meta: PartitionMeta,
    ) -> PrismResult<()>;

    /// Returns whether the partition existed.
    async fn drop_partition(&self, id: &PreAggregationId, partition: &PartitionKey)
        -> PrismResult<bool>;

    async fn list_partitions(&self, id: &PreAggregationId) -> PrismResult<Vec<PartitionKey>>;
}

/// Data source name to driver.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: DashMap<String, Arc<dyn SourceDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under its own name, replacing any previous one.
    pub fn register(&self, driver: Arc<dyn SourceDriver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn with_driver(self, driver: Arc<dyn SourceDriver>) -> Self {
        self.register(driver);
        self
    }

    pub fn get(&self, data_source: &str) -> Result<Arc<dyn SourceDriver>, EvaluationError> {
        self.drivers
            .get(data_source)
            .map(|d| Arc::clone(d.value()))
            .ok_or_else(|| EvaluationError::UnknownDataSource {
                data_source: data_source.to_string(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Plain ANSI rendering used by drivers without a dialect of their own.
pub fn render_ansi_sql(query: &QueryShape) -> String {
    let mut select = Vec::new();
    let mut group_by = Vec::new();

    for dim in &query.dimensions {
        select.push(column(dim));
        group_by.push(column(dim));
    }
    if let Some(td) = &query.time_dimension {
        if let Some(g) = td.granularity {
            let expr = format!("date_trunc('{}', {})", g, column(&td.dimension));
            select.push(expr.clone());
            group_by.push(expr);
        }
    }
    for m in &query.measures {
        let (func, arg) = match m.aggregation {
            Aggregation::Count => ("count", "*".to_string()),
            Aggregation::Sum => ("sum", column(&m.name)),
            Aggregation::Min => ("min", column(&m.name)),
            Aggregation::Max => ("max", column(&m.name)),
        };
        select.push(format!("{}({}) AS \"{}\"", func, arg, m.name));
    }

    let from: Vec<String> = query.cubes().into_iter().collect();

    let mut conditions = Vec::new();
    for f in &query.filters {
        let values: Vec<String> = f.values.iter().map(sql_literal).collect();
        let op = match f.operator {
            FilterOperator::Equals => "IN",
            FilterOperator::NotEquals => "NOT IN",
        };
        conditions.push(format!("{} {} ({})", column(&f.member), op, values.join(", ")));
    }
    if let Some(td) = &query.time_dimension {
        if let Some(range) = &td.date_range {
            conditions.push(format!(
                "{col} >= '{}' AND {col} < '{}'",
                range.start.to_rfc3339(),
                range.end.to_rfc3339(),
                col = column(&td.dimension)
            ));
        }
    }

    let mut sql = format!("SELECT {} FROM {}", select.join(", "), from.join(", "));
    if !conditions.is_empty() {
        sql.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
    }
    if !group_by.is_empty() {
        sql.push_str(&format!(" GROUP BY {}", group_by.join(", ")));
    }
    sql
}

// Members are already `cube.field`, which is a valid qualified column.
fn column(member: &str) -> String {
    member.to_string()
}

fn sql_literal(value: &ScalarValue) -> String {
    match value {
        ScalarValue::String(s) => format!("'{}'", s.replace('\'', "''")),
        ScalarValue::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}
