//! Freshness metadata carried by cache reads.

use chrono::Utc;
use prism_core::{RefreshKeyValue, Timestamp};
use std::time::Duration;

/// How a cached read was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Ready entry whose refresh key matched.
    Hit,
    /// Computed by this call.
    Computed,
    /// Attached to a computation started by another caller.
    Coalesced,
    /// Refresh key evaluation failed; the last ready value was served.
    Stale,
    /// Cache bypassed.
    Bypassed,
}

impl ReadSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadSource::Hit => "hit",
            ReadSource::Computed => "computed",
            ReadSource::Coalesced => "coalesced",
            ReadSource::Stale => "stale",
            ReadSource::Bypassed => "bypassed",
        }
    }
}

/// Result of a cache read, carrying staleness metadata.
///
/// Callers can see which data version they got and whether it was
/// recomputed, without a second lookup.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    refresh_key: Option<RefreshKeyValue>,
    computed_at: Timestamp,
    source: ReadSource,
}

impl<T> CacheRead<T> {
    pub fn new(
        value: T,
        refresh_key: Option<RefreshKeyValue>,
        computed_at: Timestamp,
        source: ReadSource,
    ) -> Self {
        Self {
            value,
            refresh_key,
            computed_at,
            source,
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Refresh key the value was computed against. `None` when bypassed.
    pub fn refresh_key(&self) -> Option<&RefreshKeyValue> {
        self.refresh_key.as_ref()
    }

    pub fn computed_at(&self) -> Timestamp {
        self.computed_at
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    /// Served without running the computation in this call.
    pub fn was_cache_hit(&self) -> bool {
        matches!(self.source, ReadSource::Hit | ReadSource::Stale)
    }

    pub fn is_stale(&self) -> bool {
        self.source == ReadSource::Stale
    }

    /// Wall-clock age of the value.
    pub fn staleness(&self) -> Duration {
        (Utc::now() - self.computed_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheRead<U> {
        CacheRead {
            value: f(self.value),
            refresh_key: self.refresh_key,
            computed_at: self.computed_at,
            source: self.source,
        }
    }
}
