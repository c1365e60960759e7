//! PRISM Test Utilities
//!
//! Shared test infrastructure for the PRISM workspace:
//! - Proptest generators for facts and time ranges
//! - An `orders` fixture: facts, rollup descriptors and queries
//! - A fault-injecting source driver

pub use prism_core::{
    FactRow, Granularity, Measure, PreAggregationDescriptor, QueryResult, QueryShape,
    RefreshKeySpec, TimeDimension, TimeRange, Timestamp,
};
pub use prism_storage::{InMemoryRollupStore, InMemorySource, SourceDriver};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use prism_core::{ScalarValue, SourceError};

/// Midnight UTC of a day in January 2024.
pub fn day(d: u32) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0)
        .single()
        .unwrap_or_else(|| panic!("invalid fixture day {}", d))
}

/// `[day(a), day(b))`.
pub fn days(a: u32, b: u32) -> TimeRange {
    TimeRange::new(day(a), day(b)).unwrap_or_else(|e| panic!("invalid fixture range: {}", e))
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for facts and ranges.

    use super::*;
    use proptest::prelude::*;

    pub const STATUSES: &[&str] = &["paid", "open", "refunded"];

    /// A timestamp in `[day(1), day(29))`, minute resolution.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (0i64..28 * 24 * 60).prop_map(|minutes| day(1) + chrono::Duration::minutes(minutes))
    }

    pub fn arb_status() -> impl Strategy<Value = &'static str> {
        prop::sample::select(STATUSES)
    }

    /// An order fact. Amounts are whole numbers so sums do not depend on
    /// addition order.
    pub fn arb_fact() -> impl Strategy<Value = FactRow> {
        (arb_timestamp(), arb_status(), 0u32..100_000).prop_map(|(ts, status, amount)| {
            FactRow::new(ts)
                .with_dimension("orders.status", status)
                .with_value("orders.amount", f64::from(amount))
        })
    }

    pub fn arb_facts(max: usize) -> impl Strategy<Value = Vec<FactRow>> {
        prop::collection::vec(arb_fact(), 0..max)
    }

    /// Day-aligned `[a, b)` inside January 2024.
    pub fn arb_day_range() -> impl Strategy<Value = TimeRange> {
        (1u32..28)
            .prop_flat_map(|a| (Just(a), (a + 1)..=29))
            .prop_map(|(a, b)| days(a, b))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! The `orders` cube used across tests.

    use super::*;

    pub const DATA_SOURCE: &str = "default";
    pub const TIME_DIMENSION: &str = "orders.created_at";

    /// Two orders per day over January 1-14: one paid, one open.
    pub fn orders_facts() -> Vec<FactRow> {
        (1..=14)
            .flat_map(|d| {
                [
                    FactRow::new(day(d) + chrono::Duration::hours(9))
                        .with_dimension("orders.status", "paid")
                        .with_value("orders.amount", f64::from(d) * 10.0),
                    FactRow::new(day(d) + chrono::Duration::hours(18))
                        .with_dimension("orders.status", "open")
                        .with_value("orders.amount", 2.5),
                ]
            })
            .collect()
    }

    pub fn orders_source() -> InMemorySource {
        InMemorySource::new(DATA_SOURCE).with_facts(orders_facts())
    }

    /// Daily rollup of amount and count by status, partitioned by day.
    pub fn orders_by_day(build_range: TimeRange) -> PreAggregationDescriptor {
        PreAggregationDescriptor::new("orders.by_day", DATA_SOURCE)
            .with_measure(Measure::sum("orders.amount"))
            .with_measure(Measure::count("orders.count"))
            .with_dimension("orders.status")
            .with_time_dimension(TIME_DIMENSION, Granularity::Day)
            .with_partitioning(Granularity::Day, build_range)
            .with_refresh_key(RefreshKeySpec::every(3600))
    }

    /// Sum of amounts over `range`, bucketed by `granularity`.
    pub fn amount_query(range: TimeRange, granularity: Granularity) -> QueryShape {
        QueryShape::new(DATA_SOURCE)
            .with_measure(Measure::sum("orders.amount"))
            .with_time_dimension(
                TimeDimension::new(TIME_DIMENSION)
                    .with_granularity(granularity)
                    .with_date_range(range),
            )
    }

    /// Amount and count by status over `range`, daily.
    pub fn status_query(range: TimeRange) -> QueryShape {
        amount_query(range, Granularity::Day)
            .with_measure(Measure::count("orders.count"))
            .with_dimension("orders.status")
    }
}

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Source driver that fails on demand, delegating to an [`InMemorySource`]
/// otherwise.
pub struct FlakySource {
    inner: InMemorySource,
    transient_failures: AtomicU64,
    fatal: AtomicBool,
    probes_fail: AtomicBool,
}

impl FlakySource {
    pub fn new(inner: InMemorySource) -> Self {
        Self {
            inner,
            transient_failures: AtomicU64::new(0),
            fatal: AtomicBool::new(false),
            probes_fail: AtomicBool::new(false),
        }
    }

    /// Fail the next `n` executions with a connection error.
    pub fn fail_next(&self, n: u64) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every execution with an SQL error.
    pub fn set_fatal(&self, fatal: bool) {
        self.fatal.store(fatal, Ordering::SeqCst);
    }

    pub fn set_probes_fail(&self, fail: bool) {
        self.probes_fail.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemorySource {
        &self.inner
    }

    fn connection_error(&self) -> SourceError {
        SourceError::Connection {
            data_source: self.inner.name().to_string(),
            reason: "injected".to_string(),
        }
    }
}

#[async_trait]
impl SourceDriver for FlakySource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn probe_refresh_value(&self, sql: &str) -> Result<ScalarValue, SourceError> {
        if self.probes_fail.load(Ordering::SeqCst) {
            return Err(self.connection_error());
        }
        self.inner.probe_refresh_value(sql).await
    }

    async fn execute(
        &self,
        query: &QueryShape,
        range: Option<TimeRange>,
    ) -> Result<QueryResult, SourceError> {
        if self.fatal.load(Ordering::SeqCst) {
            return Err(SourceError::Sql {
                data_source: self.inner.name().to_string(),
                reason: "injected".to_string(),
            });
        }
        let consumed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(self.connection_error());
        }
        self.inner.execute(query, range).await
    }
}
