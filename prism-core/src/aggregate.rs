//! Grouping and re-aggregation over the logical query model.
//!
//! Every path that produces a result (raw scan, rollup read, lambda union)
//! funnels through the same grouping so that identical
//! (dimensions, time bucket) groups always merge with each measure's own
//! aggregation.

use crate::query::{Aggregation, FactRow, QueryResult, QueryShape, ResultRow, ScalarValue};
use crate::Timestamp;
use std::collections::BTreeMap;

type GroupKey = (Vec<String>, Option<Timestamp>);

struct Group {
    dimensions: BTreeMap<String, ScalarValue>,
    time: Option<Timestamp>,
    measures: BTreeMap<String, f64>,
}

#[derive(Default)]
struct Grouper {
    groups: BTreeMap<GroupKey, Group>,
}

impl Grouper {
    fn group_for(
        &mut self,
        query: &QueryShape,
        source: &BTreeMap<String, ScalarValue>,
        time: Option<Timestamp>,
    ) -> &mut Group {
        let mut dimensions = BTreeMap::new();
        let mut key_parts = Vec::with_capacity(query.dimensions.len());
        for dim in &query.dimensions {
            let value = source.get(dim).cloned().unwrap_or(ScalarValue::Null);
            key_parts.push(value.to_string());
            dimensions.insert(dim.clone(), value);
        }
        let bucket = match (query.granularity(), time) {
            (Some(g), Some(t)) => Some(g.truncate(t)),
            _ => None,
        };
        self.groups
            .entry((key_parts, bucket))
            .or_insert_with(|| Group {
                dimensions,
                time: bucket,
                measures: BTreeMap::new(),
            })
    }

    fn finish(self) -> QueryResult {
        QueryResult::new(
            self.groups
                .into_values()
                .map(|g| ResultRow {
                    dimensions: g.dimensions,
                    time: g.time,
                    measures: g.measures,
                })
                .collect(),
        )
    }
}

fn passes_filters(query: &QueryShape, dimensions: &BTreeMap<String, ScalarValue>) -> bool {
    query
        .filters
        .iter()
        .all(|f| f.matches(dimensions.get(&f.member)))
}

fn in_range(query: &QueryShape, time: Option<Timestamp>) -> bool {
    match (query.date_range(), time) {
        (Some(range), Some(t)) => range.contains(t),
        (Some(_), None) => false,
        (None, _) => true,
    }
}

/// Aggregate raw source rows into the shape of `query`.
pub fn aggregate_facts(facts: &[FactRow], query: &QueryShape) -> QueryResult {
    let mut grouper = Grouper::default();
    for fact in facts {
        if !in_range(query, Some(fact.timestamp)) || !passes_filters(query, &fact.dimensions) {
            continue;
        }
        let group = grouper.group_for(query, &fact.dimensions, Some(fact.timestamp));
        for measure in &query.measures {
            let raw = fact.values.get(&measure.name).copied();
            let raw = match (measure.aggregation, raw) {
                (Aggregation::Count, r) => r.unwrap_or(1.0),
                (_, Some(r)) => r,
                (_, None) => continue,
            };
            let acc = group.measures.get(&measure.name).copied();
            group
                .measures
                .insert(measure.name.clone(), measure.aggregation.accumulate(acc, raw));
        }
    }
    grouper.finish()
}

/// Re-aggregate already aggregated rows into the shape of `query`.
///
/// Input rows may carry extra dimensions and a finer time bucket than the
/// query asks for; they are filtered, projected and merged. Rows whose
/// bucket start falls outside the query range are dropped, which is exact as
/// long as the range is aligned to the row granularity.
pub fn reaggregate(rows: &[ResultRow], query: &QueryShape) -> QueryResult {
    regroup(rows, query, true)
}

fn regroup(rows: &[ResultRow], query: &QueryShape, check_range: bool) -> QueryResult {
    let mut grouper = Grouper::default();
    for row in rows {
        if check_range && !in_range(query, row.time) {
            continue;
        }
        if !passes_filters(query, &row.dimensions) {
            continue;
        }
        let group = grouper.group_for(query, &row.dimensions, row.time);
        for measure in &query.measures {
            let Some(&value) = row.measures.get(&measure.name) else {
                continue;
            };
            let merged = match group.measures.get(&measure.name) {
                Some(&acc) => measure.aggregation.merge(acc, value),
                None => value,
            };
            group.measures.insert(measure.name.clone(), merged);
        }
    }
    grouper.finish()
}

/// Union two partial results of the same query.
///
/// Groups present in both are merged measure by measure, never duplicated.
/// Both inputs are already range-filtered, and a bucket may start before an
/// unaligned range start, so the range is not re-checked here.
pub fn merge_results(a: &QueryResult, b: &QueryResult, query: &QueryShape) -> QueryResult {
    let rows: Vec<ResultRow> = a.rows.iter().chain(b.rows.iter()).cloned().collect();
    regroup(&rows, query, false)
}

// =============================================================================
// TESTS
// =============================================================================
