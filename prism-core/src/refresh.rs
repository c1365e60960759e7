//! Refresh key specifications and values.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// How the "current data version" of a target is computed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RefreshKeySpec {
    /// Fixed TTL: the value changes every `interval_secs`.
    #[serde(rename_all = "camelCase")]
    Every { interval_secs: u64 },

    /// Scalar returned by a probe query against the source.
    #[serde(rename_all = "camelCase")]
    Sql {
        sql: String,
        /// Minimum seconds between two probes of the same SQL.
        renewal_threshold_secs: Option<u64>,
    },

    /// Named trigger, bumped explicitly by the host application.
    #[serde(rename_all = "camelCase")]
    Manual { name: String },
}

impl RefreshKeySpec {
    pub fn every(interval_secs: u64) -> Self {
        RefreshKeySpec::Every { interval_secs }
    }

    pub fn sql(sql: impl Into<String>) -> Self {
        RefreshKeySpec::Sql {
            sql: sql.into(),
            renewal_threshold_secs: None,
        }
    }

    pub fn manual(name: impl Into<String>) -> Self {
        RefreshKeySpec::Manual { name: name.into() }
    }

    /// Attach a per-key renewal threshold to an SQL spec. No-op otherwise.
    pub fn with_renewal_threshold(self, secs: u64) -> Self {
        match self {
            RefreshKeySpec::Sql { sql, .. } => RefreshKeySpec::Sql {
                sql,
                renewal_threshold_secs: Some(secs),
            },
            other => other,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RefreshKeySpec::Every { .. } => "every",
            RefreshKeySpec::Sql { .. } => "sql",
            RefreshKeySpec::Manual { .. } => "manual",
        }
    }
}

/// Opaque, comparable data-version token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum RefreshKeyValue {
    /// TTL bucket number, `floor(now / interval)`.
    Epoch(i64),
    /// Hash of a probe result.
    Hash(String),
    /// Manual trigger generation.
    Sequence(u64),
    /// Digest of several values.
    Composite(String),
}

impl RefreshKeyValue {
    /// Combine several values into one; order matters.
    pub fn composite(values: &[RefreshKeyValue]) -> Self {
        let mut hasher = Sha256::new();
        for value in values {
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }
        RefreshKeyValue::Composite(hex::encode(hasher.finalize()))
    }

    /// Whether `self` is known to precede `other`.
    ///
    /// Only epochs and sequences are ordered; hashes and composites never
    /// compare as older.
    pub fn is_older_than(&self, other: &RefreshKeyValue) -> bool {
        match (self, other) {
            (RefreshKeyValue::Epoch(a), RefreshKeyValue::Epoch(b)) => a < b,
            (RefreshKeyValue::Sequence(a), RefreshKeyValue::Sequence(b)) => a < b,
            _ => false,
        }
    }
}

impl fmt::Display for RefreshKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshKeyValue::Epoch(n) => write!(f, "epoch:{}", n),
            RefreshKeyValue::Hash(h) => write!(f, "hash:{}", h),
            RefreshKeyValue::Sequence(n) => write!(f, "seq:{}", n),
            RefreshKeyValue::Composite(h) => write!(f, "composite:{}", h),
        }
    }
}

/// Inputs available to refresh key evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshKeyContext {
    pub now: Timestamp,
    pub data_source: String,
}

impl RefreshKeyContext {
    pub fn new(now: Timestamp, data_source: impl Into<String>) -> Self {
        Self {
            now,
            data_source: data_source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_serde_shape() {
        let spec: RefreshKeySpec =
            serde_json::from_str(r#"{"type":"every","intervalSecs":60}"#).unwrap();
        assert_eq!(spec, RefreshKeySpec::every(60));

        let spec: RefreshKeySpec = serde_json::from_str(
            r#"{"type":"sql","sql":"SELECT max(id) FROM orders","renewalThresholdSecs":5}"#,
        )
        .unwrap();
        assert_eq!(
            spec,
            RefreshKeySpec::sql("SELECT max(id) FROM orders").with_renewal_threshold(5)
        );
    }

    #[test]
    fn test_composite_depends_on_every_part() {
        let a = RefreshKeyValue::composite(&[RefreshKeyValue::Epoch(1), RefreshKeyValue::Sequence(0)]);
        let b = RefreshKeyValue::composite(&[RefreshKeyValue::Epoch(1), RefreshKeyValue::Sequence(0)]);
        let c = RefreshKeyValue::composite(&[RefreshKeyValue::Epoch(2), RefreshKeyValue::Sequence(0)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_only_ordered_kinds_compare_as_older() {
        assert!(RefreshKeyValue::Epoch(4).is_older_than(&RefreshKeyValue::Epoch(5)));
        assert!(!RefreshKeyValue::Epoch(5).is_older_than(&RefreshKeyValue::Epoch(5)));
        assert!(RefreshKeyValue::Sequence(0).is_older_than(&RefreshKeyValue::Sequence(1)));
        assert!(!RefreshKeyValue::Epoch(1).is_older_than(&RefreshKeyValue::Sequence(2)));
        assert!(!RefreshKeyValue::Hash("a".into()).is_older_than(&RefreshKeyValue::Hash("b".into())));
    }

    #[test]
    fn test_renewal_threshold_ignored_for_ttl() {
        assert_eq!(
            RefreshKeySpec::every(10).with_renewal_threshold(3),
            RefreshKeySpec::every(10)
        );
    }
}
