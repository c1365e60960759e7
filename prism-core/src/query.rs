//! Typed logical query model.
//!
//! Stands in for the compiled SQL layer: enough structure to fingerprint a
//! query, match it against rollups, and evaluate it against in-memory rows.

use crate::time::{Granularity, TimeRange};
use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Scalar value carried by dimensions, filters and refresh probes.
pub type ScalarValue = serde_json::Value;

/// Cube name of a `cube.member` path (everything before the first `.`).
pub fn cube_of(member: &str) -> &str {
    member.split_once('.').map(|(cube, _)| cube).unwrap_or(member)
}

// ============================================================================
// MEASURES
// ============================================================================

/// Re-aggregatable aggregation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Count,
    Sum,
    Min,
    Max,
}

impl Aggregation {
    /// Fold one raw source value into an accumulator.
    pub fn accumulate(self, acc: Option<f64>, raw: f64) -> f64 {
        match (self, acc) {
            (Aggregation::Count, None) => 1.0,
            (Aggregation::Count, Some(a)) => a + 1.0,
            (_, None) => raw,
            (Aggregation::Sum, Some(a)) => a + raw,
            (Aggregation::Min, Some(a)) => a.min(raw),
            (Aggregation::Max, Some(a)) => a.max(raw),
        }
    }

    /// Combine two partial aggregates of this function.
    ///
    /// Partial counts merge by summation.
    pub fn merge(self, a: f64, b: f64) -> f64 {
        match self {
            Aggregation::Count | Aggregation::Sum => a + b,
            Aggregation::Min => a.min(b),
            Aggregation::Max => a.max(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Measure {
    pub name: String,
    pub aggregation: Aggregation,
}

impl Measure {
    pub fn new(name: impl Into<String>, aggregation: Aggregation) -> Self {
        Self {
            name: name.into(),
            aggregation,
        }
    }

    pub fn count(name: impl Into<String>) -> Self {
        Self::new(name, Aggregation::Count)
    }

    pub fn sum(name: impl Into<String>) -> Self {
        Self::new(name, Aggregation::Sum)
    }
}

// ============================================================================
// FILTERS AND TIME DIMENSION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    NotEquals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub member: String,
    pub operator: FilterOperator,
    pub values: Vec<ScalarValue>,
}

impl Filter {
    pub fn equals(member: impl Into<String>, values: Vec<ScalarValue>) -> Self {
        Self {
            member: member.into(),
            operator: FilterOperator::Equals,
            values,
        }
    }

    pub fn not_equals(member: impl Into<String>, values: Vec<ScalarValue>) -> Self {
        Self {
            member: member.into(),
            operator: FilterOperator::NotEquals,
            values,
        }
    }

    /// Whether a row whose member value is `value` passes this filter.
    ///
    /// A missing value never equals anything.
    pub fn matches(&self, value: Option<&ScalarValue>) -> bool {
        let hit = value.is_some_and(|v| self.values.contains(v));
        match self.operator {
            FilterOperator::Equals => hit,
            FilterOperator::NotEquals => !hit,
        }
    }

    fn sort_key(&self) -> (String, FilterOperator, String) {
        let values: Vec<String> = self.values.iter().map(ScalarValue::to_string).collect();
        (self.member.clone(), self.operator, values.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeDimension {
    pub dimension: String,
    pub granularity: Option<Granularity>,
    pub date_range: Option<TimeRange>,
}

impl TimeDimension {
    pub fn new(dimension: impl Into<String>) -> Self {
        Self {
            dimension: dimension.into(),
            granularity: None,
            date_range: None,
        }
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = Some(granularity);
        self
    }

    pub fn with_date_range(mut self, range: TimeRange) -> Self {
        self.date_range = Some(range);
        self
    }
}

// ============================================================================
// QUERY SHAPE
// ============================================================================

/// Logical analytical query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryShape {
    pub measures: Vec<Measure>,
    pub dimensions: Vec<String>,
    pub time_dimension: Option<TimeDimension>,
    pub filters: Vec<Filter>,
    pub data_source: String,
}

impl QueryShape {
    pub fn new(data_source: impl Into<String>) -> Self {
        Self {
            measures: Vec::new(),
            dimensions: Vec::new(),
            time_dimension: None,
            filters: Vec::new(),
            data_source: data_source.into(),
        }
    }

    pub fn with_measure(mut self, measure: Measure) -> Self {
        self.measures.push(measure);
        self
    }

    pub fn with_dimension(mut self, dimension: impl Into<String>) -> Self {
        self.dimensions.push(dimension.into());
        self
    }

    pub fn with_time_dimension(mut self, time_dimension: TimeDimension) -> Self {
        self.time_dimension = Some(time_dimension);
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Every cube referenced by measures, dimensions, filters or time.
    pub fn cubes(&self) -> BTreeSet<String> {
        let mut cubes = BTreeSet::new();
        for m in &self.measures {
            cubes.insert(cube_of(&m.name).to_string());
        }
        for d in &self.dimensions {
            cubes.insert(cube_of(d).to_string());
        }
        for f in &self.filters {
            cubes.insert(cube_of(&f.member).to_string());
        }
        if let Some(td) = &self.time_dimension {
            cubes.insert(cube_of(&td.dimension).to_string());
        }
        cubes
    }

    /// Dimensions a row must carry to answer this query: projected
    /// dimensions plus filtered members.
    pub fn required_dimensions(&self) -> BTreeSet<String> {
        self.dimensions
            .iter()
            .cloned()
            .chain(self.filters.iter().map(|f| f.member.clone()))
            .collect()
    }

    pub fn date_range(&self) -> Option<&TimeRange> {
        self.time_dimension.as_ref().and_then(|td| td.date_range.as_ref())
    }

    pub fn granularity(&self) -> Option<Granularity> {
        self.time_dimension.as_ref().and_then(|td| td.granularity)
    }

    /// Canonical form: members sorted and deduplicated, filter values sorted.
    ///
    /// Two queries that differ only in member order normalize identically.
    pub fn normalized(&self) -> QueryShape {
        let mut measures = self.measures.clone();
        measures.sort_by(|a, b| a.name.cmp(&b.name).then(a.aggregation.cmp(&b.aggregation)));
        measures.dedup();

        let mut dimensions = self.dimensions.clone();
        dimensions.sort();
        dimensions.dedup();

        let mut filters: Vec<Filter> = self
            .filters
            .iter()
            .map(|f| {
                let mut values = f.values.clone();
                values.sort_by_key(ScalarValue::to_string);
                values.dedup();
                Filter {
                    member: f.member.clone(),
                    operator: f.operator,
                    values,
                }
            })
            .collect();
        filters.sort_by_key(Filter::sort_key);
        filters.dedup();

        QueryShape {
            measures,
            dimensions,
            time_dimension: self.time_dimension.clone(),
            filters,
            data_source: self.data_source.clone(),
        }
    }

    /// Same query with its date range replaced by `range`.
    ///
    /// Used to send the real-time half of a lambda query to the source.
    pub fn restricted_to(&self, range: TimeRange) -> QueryShape {
        let mut query = self.clone();
        if let Some(td) = query.time_dimension.as_mut() {
            td.date_range = Some(range);
        }
        query
    }
}

// ============================================================================
// ROWS
// ============================================================================

/// Raw row as stored in a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRow {
    pub timestamp: Timestamp,
    pub dimensions: BTreeMap<String, ScalarValue>,
    pub values: BTreeMap<String, f64>,
}

impl FactRow {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            dimensions: BTreeMap::new(),
            values: BTreeMap::new(),
        }
    }

    pub fn with_dimension(mut self, name: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        self.dimensions.insert(name.into(), value.into());
        self
    }

    pub fn with_value(mut self, measure: impl Into<String>, value: f64) -> Self {
        self.values.insert(measure.into(), value);
        self
    }
}

/// Aggregated row: one group of dimension values and time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub dimensions: BTreeMap<String, ScalarValue>,
    pub time: Option<Timestamp>,
    pub measures: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<ResultRow>,
}

impl QueryResult {
    pub fn new(rows: Vec<ResultRow>) -> Self {
        Self { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in deterministic order (time bucket, then dimension values).
    pub fn sorted(mut self) -> Self {
        self.rows.sort_by_cached_key(|row| {
            let dims: Vec<String> = row.dimensions.values().map(ScalarValue::to_string).collect();
            (row.time, dims)
        });
        self
    }

    /// Sum of one measure across all rows.
    pub fn total(&self, measure: &str) -> f64 {
        self.rows
            .iter()
            .filter_map(|row| row.measures.get(measure))
            .sum()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cube_of() {
        assert_eq!(cube_of("orders.amount"), "orders");
        assert_eq!(cube_of("orders"), "orders");
    }

    #[test]
    fn test_accumulate_and_merge() {
        let count = Aggregation::Count;
        assert_eq!(count.accumulate(Some(count.accumulate(None, 7.0)), 9.0), 2.0);
        assert_eq!(count.merge(3.0, 4.0), 7.0);

        let min = Aggregation::Min;
        assert_eq!(min.accumulate(Some(5.0), 2.0), 2.0);
        assert_eq!(min.merge(5.0, 2.0), 2.0);

        let max = Aggregation::Max;
        assert_eq!(max.merge(5.0, 2.0), 5.0);
    }

    #[test]
    fn test_filter_matches() {
        let eq = Filter::equals("orders.status", vec![json!("paid")]);
        assert!(eq.matches(Some(&json!("paid"))));
        assert!(!eq.matches(Some(&json!("open"))));
        assert!(!eq.matches(None));

        let ne = Filter::not_equals("orders.status", vec![json!("paid")]);
        assert!(ne.matches(None));
        assert!(!ne.matches(Some(&json!("paid"))));
    }

    #[test]
    fn test_normalized_ignores_member_order() {
        let a = QueryShape::new("default")
            .with_measure(Measure::sum("orders.amount"))
            .with_measure(Measure::count("orders.count"))
            .with_dimension("orders.status")
            .with_dimension("orders.city")
            .with_filter(Filter::equals("orders.city", vec![json!("b"), json!("a")]));
        let b = QueryShape::new("default")
            .with_measure(Measure::count("orders.count"))
            .with_measure(Measure::sum("orders.amount"))
            .with_dimension("orders.city")
            .with_dimension("orders.status")
            .with_filter(Filter::equals("orders.city", vec![json!("a"), json!("b")]));

        assert_ne!(a, b);
        assert_eq!(a.normalized(), b.normalized());
    }

    #[test]
    fn test_required_dimensions_include_filters() {
        let q = QueryShape::new("default")
            .with_dimension("orders.status")
            .with_filter(Filter::equals("orders.tenant", vec![json!("t1")]));
        let required = q.required_dimensions();
        assert!(required.contains("orders.status"));
        assert!(required.contains("orders.tenant"));
        assert_eq!(q.cubes().len(), 1);
    }
}
