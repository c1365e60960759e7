//! Query fingerprints.
//!
//! A [`Fingerprint`] can only be computed from a [`FilteredQuery`], and a
//! `FilteredQuery` can only be produced by running a [`QueryRewrite`]. Hashing
//! an unfiltered query is therefore unrepresentable.

use crate::error::SecurityError;
use crate::query::QueryShape;
use crate::security::{QueryRewrite, SecurityContext};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A query that has passed through the security rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredQuery {
    shape: QueryShape,
}

impl FilteredQuery {
    /// Run `rewrite` over `query` and seal the result.
    pub fn apply(
        query: QueryShape,
        rewrite: &dyn QueryRewrite,
        context: &SecurityContext,
    ) -> Result<Self, SecurityError> {
        let shape = rewrite.rewrite(query, context)?;
        Ok(Self {
            shape: shape.normalized(),
        })
    }

    /// The rewritten, normalized query.
    pub fn shape(&self) -> &QueryShape {
        &self.shape
    }

    pub fn into_shape(self) -> QueryShape {
        self.shape
    }
}

/// SHA-256 (hex) of the canonical JSON of a normalized, filtered query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(query: &FilteredQuery) -> Self {
        // QueryShape serializes through BTreeMaps and sorted Vecs only, so the
        // JSON text is canonical once normalized.
        let canonical = serde_json::to_vec(query.shape()).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Fingerprint(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fingerprint scoped to one application id.
///
/// The private inner struct means a scoped key cannot exist without an app
/// id, so two tenants can never address the same cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopedFingerprint {
    inner: ScopedInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ScopedInner {
    app_id: String,
    fingerprint: Fingerprint,
}

impl ScopedFingerprint {
    pub fn new(app_id: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            inner: ScopedInner {
                app_id: app_id.into(),
                fingerprint,
            },
        }
    }

    pub fn app_id(&self) -> &str {
        &self.inner.app_id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.inner.fingerprint
    }
}

impl fmt::Display for ScopedFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.inner.app_id, self.inner.fingerprint.short())
    }
}

// =============================================================================
// TESTS
// =============================================================================
