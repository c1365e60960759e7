//! Time granularities and half-open time ranges.

use crate::error::ValidationError;
use crate::Timestamp;
use chrono::{Datelike, Duration, Months};
use serde::{Deserialize, Serialize};
use std::fmt;

const SECONDS_PER_MINUTE: i64 = 60;
const SECONDS_PER_HOUR: i64 = 3_600;
const SECONDS_PER_DAY: i64 = 86_400;

// ============================================================================
// GRANULARITY
// ============================================================================

/// Time bucket size, ordered from finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    /// Truncate a timestamp to the start of its bucket.
    ///
    /// Weeks start on Monday. All arithmetic is in UTC.
    pub fn truncate(self, ts: Timestamp) -> Timestamp {
        match self {
            Granularity::Second => floor_seconds(ts, 1),
            Granularity::Minute => floor_seconds(ts, SECONDS_PER_MINUTE),
            Granularity::Hour => floor_seconds(ts, SECONDS_PER_HOUR),
            Granularity::Day => floor_seconds(ts, SECONDS_PER_DAY),
            Granularity::Week => {
                let day = Granularity::Day.truncate(ts);
                day - Duration::days(i64::from(day.weekday().num_days_from_monday()))
            }
            Granularity::Month => {
                let day = Granularity::Day.truncate(ts);
                day - Duration::days(i64::from(day.day0()))
            }
            Granularity::Quarter => {
                let month = Granularity::Month.truncate(ts);
                month - Months::new(month.month0() % 3)
            }
            Granularity::Year => {
                let month = Granularity::Month.truncate(ts);
                month - Months::new(month.month0())
            }
        }
    }

    /// Start of the bucket following the one `ts` starts.
    ///
    /// `ts` is expected to be aligned; unaligned input is truncated first.
    pub fn advance(self, ts: Timestamp) -> Timestamp {
        let start = self.truncate(ts);
        match self {
            Granularity::Second => start + Duration::seconds(1),
            Granularity::Minute => start + Duration::seconds(SECONDS_PER_MINUTE),
            Granularity::Hour => start + Duration::seconds(SECONDS_PER_HOUR),
            Granularity::Day => start + Duration::days(1),
            Granularity::Week => start + Duration::days(7),
            Granularity::Month => start + Months::new(1),
            Granularity::Quarter => start + Months::new(3),
            Granularity::Year => start + Months::new(12),
        }
    }

    /// Whether rows bucketed at `self` can be re-aggregated into `target` buckets.
    ///
    /// Weeks straddle month boundaries, so they roll up into nothing but weeks,
    /// and only day-or-finer buckets roll up into weeks.
    pub fn can_roll_up_to(self, target: Granularity) -> bool {
        if self == target {
            return true;
        }
        match (self, target) {
            (_, Granularity::Week) => self <= Granularity::Day,
            (Granularity::Week, _) => false,
            _ => self < target,
        }
    }

    /// Whether `ts` sits exactly on a bucket boundary.
    pub fn is_aligned(self, ts: Timestamp) -> bool {
        self.truncate(ts) == ts
    }

    /// Finer than a day.
    pub fn is_sub_day(self) -> bool {
        self < Granularity::Day
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Quarter => "quarter",
            Granularity::Year => "year",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn floor_seconds(ts: Timestamp, step: i64) -> Timestamp {
    let secs = ts.timestamp();
    let offset = secs.rem_euclid(step);
    ts - Duration::seconds(offset) - Duration::nanoseconds(i64::from(ts.timestamp_subsec_nanos()))
}

// ============================================================================
// TIME RANGE
// ============================================================================

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a range, rejecting `start > end`.
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self, ValidationError> {
        if start > end {
            return Err(ValidationError::InvalidTimeRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Whether `other` lies entirely inside this range.
    pub fn covers(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlap of two ranges, `None` when they are disjoint.
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(TimeRange { start, end })
    }

    /// Split into `[start, cutover)` and `[cutover, end)`.
    ///
    /// Either side is `None` when empty.
    pub fn split_at(&self, cutover: Timestamp) -> (Option<TimeRange>, Option<TimeRange>) {
        if self.is_empty() {
            return (None, None);
        }
        let cut = cutover.clamp(self.start, self.end);
        let lower = TimeRange {
            start: self.start,
            end: cut,
        };
        let upper = TimeRange {
            start: cut,
            end: self.end,
        };
        (
            (!lower.is_empty()).then_some(lower),
            (!upper.is_empty()).then_some(upper),
        )
    }

    /// Whole buckets of `granularity` touching this range, in order.
    ///
    /// The first bucket starts at `granularity.truncate(start)`, so bucket
    /// boundaries are calendar-aligned even when the range is not.
    pub fn buckets(&self, granularity: Granularity) -> Vec<TimeRange> {
        let mut buckets = Vec::new();
        let mut cursor = granularity.truncate(self.start);
        while cursor < self.end {
            let next = granularity.advance(cursor);
            buckets.push(TimeRange {
                start: cursor,
                end: next,
            });
            cursor = next;
        }
        buckets
    }

    /// Whether both bounds sit on `granularity` boundaries.
    pub fn is_aligned_to(&self, granularity: Granularity) -> bool {
        granularity.is_aligned(self.start) && granularity.is_aligned(self.end)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

// =============================================================================
// TESTS
// =============================================================================
