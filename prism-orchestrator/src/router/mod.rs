//! Rollup Router
//!
//! Decides where a filtered query is answered from:
//!
//! ```text
//! candidates (registry.lookup, most specific first)
//!   ├─→ covering partitions all servable      → Rollup
//!   ├─→ lambda, built prefix ends inside range → Lambda
//!   └─→ nothing                               → Raw, or NoMatchingRollup
//!                                               in rollup-only mode
//! ```
//!
//! Stale partitions are servable: data built against an older refresh key is
//! returned while the rebuild runs.

mod execution;

pub use execution::{execute_lambda, read_rollup};

use std::sync::Arc;

use prism_core::{
    Fingerprint, Partition, PreAggregationDescriptor, QueryShape, RoutingError, Timestamp,
};
use serde::Serialize;

use crate::registry::PreAggregationRegistry;

/// Where a query is answered from.
#[derive(Debug, Clone)]
pub enum Route {
    /// Straight from the data source.
    Raw,
    /// From stored partitions only.
    Rollup {
        pre_aggregation: Arc<PreAggregationDescriptor>,
        partitions: Vec<Partition>,
    },
    /// Stored partitions below `cutover`, the data source from `cutover` on.
    Lambda {
        pre_aggregation: Arc<PreAggregationDescriptor>,
        partitions: Vec<Partition>,
        cutover: Timestamp,
    },
}

impl Route {
    pub fn kind(&self) -> RouteKind {
        match self {
            Route::Raw => RouteKind::Raw,
            Route::Rollup { .. } => RouteKind::Rollup,
            Route::Lambda { .. } => RouteKind::Lambda,
        }
    }

    pub fn pre_aggregation(&self) -> Option<&Arc<PreAggregationDescriptor>> {
        match self {
            Route::Raw => None,
            Route::Rollup {
                pre_aggregation, ..
            }
            | Route::Lambda {
                pre_aggregation, ..
            } => Some(pre_aggregation),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Raw,
    Rollup,
    Lambda,
}

impl RouteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteKind::Raw => "raw",
            RouteKind::Rollup => "rollup",
            RouteKind::Lambda => "lambda",
        }
    }
}

impl std::fmt::Display for RouteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partitions a query needs that cannot be served yet.
#[derive(Debug, Clone)]
pub struct MissingPartitions {
    pub pre_aggregation: Arc<PreAggregationDescriptor>,
    pub partitions: Vec<Partition>,
}

pub struct RollupRouter {
    registry: Arc<PreAggregationRegistry>,
    rollup_only: bool,
}

impl RollupRouter {
    pub fn new(registry: Arc<PreAggregationRegistry>, rollup_only: bool) -> Self {
        Self {
            registry,
            rollup_only,
        }
    }

    pub fn is_rollup_only(&self) -> bool {
        self.rollup_only
    }

    pub fn route(
        &self,
        query: &QueryShape,
        fingerprint: &Fingerprint,
    ) -> Result<Route, RoutingError> {
        let candidates = self.registry.lookup(query);
        let range = query.date_range();

        for descriptor in &candidates {
            let Some(partitions) = descriptor.covering_partitions(range) else {
                continue;
            };
            if self.all_servable(descriptor, &partitions) {
                tracing::debug!(
                    fingerprint = %fingerprint.short(),
                    pre_aggregation = %descriptor.id,
                    partitions = partitions.len(),
                    "Routed to rollup"
                );
                return Ok(Route::Rollup {
                    pre_aggregation: Arc::clone(descriptor),
                    partitions,
                });
            }
        }

        if let Some(range) = range {
            for descriptor in candidates.iter().filter(|d| d.lambda) {
                let Some(cutover) = self.registry.built_cutover(&descriptor.id) else {
                    continue;
                };
                let (Some(lower), Some(_)) = range.split_at(cutover) else {
                    continue;
                };
                let partitions = descriptor.partitions_overlapping(&lower);
                if !self.all_servable(descriptor, &partitions) {
                    continue;
                }
                tracing::debug!(
                    fingerprint = %fingerprint.short(),
                    pre_aggregation = %descriptor.id,
                    cutover = %cutover,
                    "Routed to lambda"
                );
                return Ok(Route::Lambda {
                    pre_aggregation: Arc::clone(descriptor),
                    partitions,
                    cutover,
                });
            }
        }

        if self.rollup_only {
            tracing::warn!(
                fingerprint = %fingerprint.short(),
                candidates = candidates.len(),
                "No servable rollup in rollup-only mode"
            );
            return Err(RoutingError::NoMatchingRollup {
                fingerprint: fingerprint.short().to_string(),
            });
        }
        tracing::debug!(fingerprint = %fingerprint.short(), "Routed to source");
        Ok(Route::Raw)
    }

    /// First refreshable candidate fully covering `query`, with the
    /// partitions it still lacks.
    ///
    /// Rollup-only descriptors are built elsewhere and never returned.
    pub fn missing_partitions(&self, query: &QueryShape) -> Option<MissingPartitions> {
        let range = query.date_range();
        self.registry
            .lookup(query)
            .into_iter()
            .filter(|d| !d.rollup_only)
            .find_map(|descriptor| {
                let partitions: Vec<Partition> = descriptor
                    .covering_partitions(range)?
                    .into_iter()
                    .filter(|p| !self.is_servable(&descriptor, p))
                    .collect();
                (!partitions.is_empty()).then_some(MissingPartitions {
                    pre_aggregation: descriptor,
                    partitions,
                })
            })
    }

    fn is_servable(&self, descriptor: &PreAggregationDescriptor, partition: &Partition) -> bool {
        self.registry
            .partition_state(&descriptor.id, &partition.key)
            .is_some_and(|s| s.is_servable())
    }

    fn all_servable(&self, descriptor: &PreAggregationDescriptor, partitions: &[Partition]) -> bool {
        partitions.iter().all(|p| self.is_servable(descriptor, p))
    }
}

// =============================================================================
// TESTS
// =============================================================================
