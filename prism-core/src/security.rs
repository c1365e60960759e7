//! Security context and the query rewrite seam.
//!
//! Concrete rewrite strategies live in the orchestrator. This module only
//! defines the trait and the context it receives, so that
//! [`FilteredQuery`](crate::FilteredQuery) can be built here and nowhere else.

use crate::error::SecurityError;
use crate::query::{QueryShape, ScalarValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attributes describing the caller (tenant, user, roles...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub attributes: BTreeMap<String, ScalarValue>,
}

impl SecurityContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&ScalarValue> {
        self.attributes.get(name)
    }

    /// Attribute value or `MissingAttribute`.
    pub fn require(&self, name: &str) -> Result<&ScalarValue, SecurityError> {
        self.get(name).ok_or_else(|| SecurityError::MissingAttribute {
            attribute: name.to_string(),
        })
    }
}

/// Pre-fingerprint query rewrite.
///
/// Implementations must be deterministic: the same query and context always
/// produce the same rewritten query. They may add filters or dimensions,
/// or reject the query outright.
pub trait QueryRewrite: Send + Sync {
    /// Strategy name for logs.
    fn name(&self) -> &'static str;

    fn rewrite(&self, query: QueryShape, context: &SecurityContext)
        -> Result<QueryShape, SecurityError>;
}
