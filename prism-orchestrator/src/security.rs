//! Query rewrite strategies and app id resolution.
//!
//! Every query passes through exactly one [`QueryRewrite`] before it is
//! fingerprinted, so tenant filters always take part in the cache key.

use std::sync::Arc;

use prism_core::{Filter, QueryRewrite, QueryShape, SecurityContext, SecurityError};

use crate::constants::{DEFAULT_APP_ID, DEFAULT_TENANT_ATTRIBUTE};

// ============================================================================
// REWRITE STRATEGIES
// ============================================================================

/// Leaves the query untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl QueryRewrite for PassThrough {
    fn name(&self) -> &'static str {
        "pass_through"
    }

    fn rewrite(
        &self,
        query: QueryShape,
        _context: &SecurityContext,
    ) -> Result<QueryShape, SecurityError> {
        Ok(query)
    }
}

/// Restricts every query to the caller's tenant.
///
/// Adds `member = context[attribute]`. A context without the attribute, or
/// with a null value, is rejected.
#[derive(Debug, Clone)]
pub struct TenantFilter {
    pub member: String,
    pub attribute: String,
}

impl TenantFilter {
    pub fn new(member: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            member: member.into(),
            attribute: attribute.into(),
        }
    }

    /// Filter on `member` using the default tenant attribute.
    pub fn on(member: impl Into<String>) -> Self {
        Self::new(member, DEFAULT_TENANT_ATTRIBUTE)
    }
}

impl QueryRewrite for TenantFilter {
    fn name(&self) -> &'static str {
        "tenant_filter"
    }

    fn rewrite(
        &self,
        query: QueryShape,
        context: &SecurityContext,
    ) -> Result<QueryShape, SecurityError> {
        let tenant = context.require(&self.attribute)?;
        if tenant.is_null() {
            return Err(SecurityError::QueryRejected {
                reason: format!("{} is null", self.attribute),
            });
        }
        Ok(query.with_filter(Filter::equals(self.member.clone(), vec![tenant.clone()])))
    }
}

/// Rejects contexts lacking any of the listed attributes.
#[derive(Debug, Clone, Default)]
pub struct RequireAttributes {
    pub attributes: Vec<String>,
}

impl RequireAttributes {
    pub fn new<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            attributes: attributes.into_iter().map(Into::into).collect(),
        }
    }
}

impl QueryRewrite for RequireAttributes {
    fn name(&self) -> &'static str {
        "require_attributes"
    }

    fn rewrite(
        &self,
        query: QueryShape,
        context: &SecurityContext,
    ) -> Result<QueryShape, SecurityError> {
        for attribute in &self.attributes {
            context.require(attribute)?;
        }
        Ok(query)
    }
}

/// Applies several strategies in order; the first rejection wins.
#[derive(Clone, Default)]
pub struct RewriteChain {
    steps: Vec<Arc<dyn QueryRewrite>>,
}

impl RewriteChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, step: impl QueryRewrite + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl QueryRewrite for RewriteChain {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn rewrite(
        &self,
        query: QueryShape,
        context: &SecurityContext,
    ) -> Result<QueryShape, SecurityError> {
        self.steps.iter().try_fold(query, |query, step| {
            step.rewrite(query, context).map_err(|e| {
                tracing::debug!(strategy = step.name(), error = %e, "Query rejected");
                e
            })
        })
    }
}

// ============================================================================
// APP ID RESOLUTION
// ============================================================================

/// Maps a security context to the app id that scopes cache keys.
pub trait AppIdResolver: Send + Sync {
    fn app_id(&self, context: &SecurityContext) -> String;
}

/// Same app id for everyone.
#[derive(Debug, Clone)]
pub struct DefaultAppId(pub String);

impl Default for DefaultAppId {
    fn default() -> Self {
        Self(DEFAULT_APP_ID.to_string())
    }
}

impl AppIdResolver for DefaultAppId {
    fn app_id(&self, _context: &SecurityContext) -> String {
        self.0.clone()
    }
}

/// App id taken from a context attribute, with a fallback when absent.
#[derive(Debug, Clone)]
pub struct AttributeAppId {
    pub attribute: String,
    pub fallback: String,
}

impl Default for AttributeAppId {
    fn default() -> Self {
        Self::new(DEFAULT_TENANT_ATTRIBUTE)
    }
}

impl AttributeAppId {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            fallback: DEFAULT_APP_ID.to_string(),
        }
    }
}

impl AppIdResolver for AttributeAppId {
    fn app_id(&self, context: &SecurityContext) -> String {
        match context.get(&self.attribute) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => self.fallback.clone(),
            Some(other) => other.to_string(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::{FilteredQuery, Fingerprint, Measure};
    use serde_json::json;

    fn query() -> QueryShape {
        QueryShape::new("default").with_measure(Measure::sum("orders.amount"))
    }

    fn tenant(id: &str) -> SecurityContext {
        SecurityContext::new().with_attribute("tenantId", id)
    }

    #[test]
    fn test_tenant_filter_injects_member() {
        let rewritten = TenantFilter::on("orders.tenant_id")
            .rewrite(query(), &tenant("acme"))
            .unwrap();
        assert_eq!(
            rewritten.filters,
            vec![Filter::equals("orders.tenant_id", vec![json!("acme")])]
        );
    }

    #[test]
    fn test_tenant_filter_rejects_missing_or_null() {
        let filter = TenantFilter::on("orders.tenant_id");
        assert_eq!(
            filter.rewrite(query(), &SecurityContext::new()).unwrap_err(),
            SecurityError::MissingAttribute {
                attribute: "tenantId".to_string()
            }
        );
        let null = SecurityContext::new().with_attribute("tenantId", serde_json::Value::Null);
        assert!(matches!(
            filter.rewrite(query(), &null),
            Err(SecurityError::QueryRejected { .. })
        ));
    }

    #[test]
    fn test_tenants_get_distinct_fingerprints() {
        let filter = TenantFilter::on("orders.tenant_id");
        let a = Fingerprint::of(&FilteredQuery::apply(query(), &filter, &tenant("a")).unwrap());
        let b = Fingerprint::of(&FilteredQuery::apply(query(), &filter, &tenant("b")).unwrap());
        let a2 = Fingerprint::of(&FilteredQuery::apply(query(), &filter, &tenant("a")).unwrap());
        assert_ne!(a, b);
        assert_eq!(a, a2);
    }

    #[test]
    fn test_chain_stops_at_first_rejection() {
        let chain = RewriteChain::new()
            .then(RequireAttributes::new(["userId"]))
            .then(TenantFilter::on("orders.tenant_id"));
        assert_eq!(chain.len(), 2);
        assert_eq!(
            chain.rewrite(query(), &tenant("acme")).unwrap_err(),
            SecurityError::MissingAttribute {
                attribute: "userId".to_string()
            }
        );

        let ctx = tenant("acme").with_attribute("userId", 7);
        assert_eq!(chain.rewrite(query(), &ctx).unwrap().filters.len(), 1);
        assert!(RewriteChain::new().rewrite(query(), &ctx).is_ok());
    }

    #[test]
    fn test_app_id_resolvers() {
        assert_eq!(DefaultAppId::default().app_id(&tenant("acme")), "STANDALONE");

        let resolver = AttributeAppId::default();
        assert_eq!(resolver.app_id(&tenant("acme")), "acme");
        assert_eq!(resolver.app_id(&SecurityContext::new()), "STANDALONE");
        assert_eq!(
            resolver.app_id(&SecurityContext::new().with_attribute("tenantId", 42)),
            "42"
        );
    }
}
