//! Refresh key evaluation.
//!
//! A refresh key value identifies the data version a cached result was
//! computed against. Three kinds are supported:
//!
//! - `Every`: a TTL bucket number derived from the clock, no I/O
//! - `Sql`: a hashed scalar from a probe query, reused for the renewal
//!   threshold so that a burst of queries issues one probe
//! - `Manual`: a generation counter bumped by [`RefreshKeyEvaluator::signal`]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use prism_core::{
    EvaluationError, RefreshKeyContext, RefreshKeySpec, RefreshKeyValue, Timestamp,
    DEFAULT_RENEWAL_THRESHOLD_SECS,
};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::backend::DriverRegistry;

#[derive(Debug, Clone)]
struct CachedProbe {
    value: RefreshKeyValue,
    probed_at: Timestamp,
}

/// Evaluator counters.
#[derive(Debug, Default)]
pub struct EvaluatorMetrics {
    pub probes_issued: AtomicU64,
    pub probes_reused: AtomicU64,
    pub probe_failures: AtomicU64,
}

impl EvaluatorMetrics {
    pub fn snapshot(&self) -> EvaluatorMetricsSnapshot {
        EvaluatorMetricsSnapshot {
            probes_issued: self.probes_issued.load(Ordering::Relaxed),
            probes_reused: self.probes_reused.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluatorMetricsSnapshot {
    pub probes_issued: u64,
    pub probes_reused: u64,
    pub probe_failures: u64,
}

/// Computes [`RefreshKeyValue`]s.
pub struct RefreshKeyEvaluator {
    drivers: Arc<DriverRegistry>,
    /// Global renewal threshold; overrides per-key thresholds when set.
    global_renewal_threshold: Option<u64>,
    probes: DashMap<String, Arc<Mutex<Option<CachedProbe>>>>,
    generations: DashMap<String, u64>,
    metrics: EvaluatorMetrics,
}

impl RefreshKeyEvaluator {
    pub fn new(drivers: Arc<DriverRegistry>) -> Self {
        Self {
            drivers,
            global_renewal_threshold: None,
            probes: DashMap::new(),
            generations: DashMap::new(),
            metrics: EvaluatorMetrics::default(),
        }
    }

    pub fn with_global_renewal_threshold(mut self, secs: Option<u64>) -> Self {
        self.global_renewal_threshold = secs;
        self
    }

    pub fn metrics(&self) -> &EvaluatorMetrics {
        &self.metrics
    }

    /// Evaluate `spec` at `context.now`.
    ///
    /// # Errors
    ///
    /// `EvaluationError` when a probe cannot run. Callers holding an older
    /// value may keep serving it.
    pub async fn evaluate(
        &self,
        spec: &RefreshKeySpec,
        context: &RefreshKeyContext,
    ) -> Result<RefreshKeyValue, EvaluationError> {
        match spec {
            RefreshKeySpec::Every { interval_secs } => {
                if *interval_secs == 0 {
                    return Err(EvaluationError::InvalidSpec {
                        reason: "every interval must be positive".to_string(),
                    });
                }
                Ok(RefreshKeyValue::Epoch(
                    context.now.timestamp().div_euclid(*interval_secs as i64),
                ))
            }
            RefreshKeySpec::Sql {
                sql,
                renewal_threshold_secs,
            } => {
                let threshold = self
                    .global_renewal_threshold
                    .or(*renewal_threshold_secs)
                    .unwrap_or(DEFAULT_RENEWAL_THRESHOLD_SECS);
                self.evaluate_probe(sql, threshold, context).await
            }
            RefreshKeySpec::Manual { name } => Ok(RefreshKeyValue::Sequence(
                self.generations.get(name).map(|g| *g).unwrap_or(0),
            )),
        }
    }

    async fn evaluate_probe(
        &self,
        sql: &str,
        threshold_secs: u64,
        context: &RefreshKeyContext,
    ) -> Result<RefreshKeyValue, EvaluationError> {
        let slot = self
            .probes
            .entry(probe_key(&context.data_source, sql))
            .or_default()
            .clone();

        // Held across the probe: concurrent evaluations of the same key queue
        // here and then find the fresh value.
        let mut cached = slot.lock().await;
        if let Some(probe) = cached.as_ref() {
            let age = context.now - probe.probed_at;
            if age >= Duration::zero() && age < Duration::seconds(threshold_secs as i64) {
                self.metrics.probes_reused.fetch_add(1, Ordering::Relaxed);
                return Ok(probe.value.clone());
            }
        }

        let driver = self.drivers.get(&context.data_source)?;
        self.metrics.probes_issued.fetch_add(1, Ordering::Relaxed);
        match driver.probe_refresh_value(sql).await {
            Ok(scalar) => {
                let value = RefreshKeyValue::Hash(hash_scalar(&scalar));
                *cached = Some(CachedProbe {
                    value: value.clone(),
                    probed_at: context.now,
                });
                Ok(value)
            }
            Err(e) => {
                self.metrics.probe_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    data_source = %context.data_source,
                    error = %e,
                    "Refresh key probe failed"
                );
                Err(EvaluationError::ProbeFailed {
                    data_source: context.data_source.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Bump a manual trigger. Returns the new generation.
    pub fn signal(&self, name: &str) -> u64 {
        let mut generation = self.generations.entry(name.to_string()).or_insert(0);
        *generation += 1;
        tracing::info!(trigger = %name, generation = *generation, "Manual refresh signalled");
        *generation
    }

    /// Forget the cached value of an SQL probe so the next evaluation
    /// re-probes. No-op for other kinds.
    pub fn invalidate(&self, spec: &RefreshKeySpec, data_source: &str) {
        if let RefreshKeySpec::Sql { sql, .. } = spec {
            self.probes.remove(&probe_key(data_source, sql));
        }
    }
}

fn probe_key(data_source: &str, sql: &str) -> String {
    format!("{}\u{1f}{}", data_source, sql)
}

fn hash_scalar(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SourceDriver;
    use crate::memory::InMemorySource;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn at(secs: i64) -> RefreshKeyContext {
        RefreshKeyContext::new(Utc.timestamp_opt(secs, 0).unwrap(), "default")
    }

    fn evaluator_with(source: Arc<InMemorySource>) -> RefreshKeyEvaluator {
        let drivers = DriverRegistry::new().with_driver(source as Arc<dyn SourceDriver>);
        RefreshKeyEvaluator::new(Arc::new(drivers))
    }

    #[tokio::test]
    async fn test_every_buckets_time() {
        let evaluator = RefreshKeyEvaluator::new(Arc::new(DriverRegistry::new()));
        let spec = RefreshKeySpec::every(60);

        let v0 = evaluator.evaluate(&spec, &at(0)).await.unwrap();
        let v30 = evaluator.evaluate(&spec, &at(30)).await.unwrap();
        let v61 = evaluator.evaluate(&spec, &at(61)).await.unwrap();
        assert_eq!(v0, RefreshKeyValue::Epoch(0));
        assert_eq!(v0, v30);
        assert_eq!(v61, RefreshKeyValue::Epoch(1));
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let evaluator = RefreshKeyEvaluator::new(Arc::new(DriverRegistry::new()));
        let result = evaluator.evaluate(&RefreshKeySpec::every(0), &at(0)).await;
        assert!(matches!(result, Err(EvaluationError::InvalidSpec { .. })));
    }

    #[tokio::test]
    async fn test_sql_probe_reused_within_threshold() {
        let source = Arc::new(InMemorySource::new("default"));
        source.set_probe("SELECT max(id) FROM orders", json!(1));
        let evaluator = evaluator_with(Arc::clone(&source));
        let spec = RefreshKeySpec::sql("SELECT max(id) FROM orders").with_renewal_threshold(10);

        let first = evaluator.evaluate(&spec, &at(100)).await.unwrap();
        source.set_probe("SELECT max(id) FROM orders", json!(2));
        let reused = evaluator.evaluate(&spec, &at(105)).await.unwrap();
        let renewed = evaluator.evaluate(&spec, &at(110)).await.unwrap();

        assert_eq!(first, reused);
        assert_ne!(first, renewed);
        assert_eq!(source.probe_calls(), 2);
        assert_eq!(evaluator.metrics().snapshot().probes_reused, 1);
    }

    #[tokio::test]
    async fn test_global_threshold_takes_precedence() {
        let source = Arc::new(InMemorySource::new("default"));
        let evaluator = evaluator_with(Arc::clone(&source)).with_global_renewal_threshold(Some(1));
        let spec = RefreshKeySpec::sql("SELECT 1").with_renewal_threshold(3_600);

        evaluator.evaluate(&spec, &at(0)).await.unwrap();
        evaluator.evaluate(&spec, &at(2)).await.unwrap();
        assert_eq!(source.probe_calls(), 2);
    }

    #[tokio::test]
    async fn test_default_threshold_is_120_seconds() {
        let source = Arc::new(InMemorySource::new("default"));
        let evaluator = evaluator_with(Arc::clone(&source));
        let spec = RefreshKeySpec::sql("SELECT 1");

        evaluator.evaluate(&spec, &at(0)).await.unwrap();
        evaluator.evaluate(&spec, &at(119)).await.unwrap();
        assert_eq!(source.probe_calls(), 1);
        evaluator.evaluate(&spec, &at(120)).await.unwrap();
        assert_eq!(source.probe_calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_probes_are_serialized() {
        let source = Arc::new(
            InMemorySource::new("default").with_latency(std::time::Duration::from_millis(20)),
        );
        let evaluator = Arc::new(evaluator_with(Arc::clone(&source)));
        let spec = RefreshKeySpec::sql("SELECT count(*) FROM orders");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let evaluator = Arc::clone(&evaluator);
                let spec = spec.clone();
                tokio::spawn(async move { evaluator.evaluate(&spec, &at(50)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(source.probe_calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_data_source() {
        let evaluator = RefreshKeyEvaluator::new(Arc::new(DriverRegistry::new()));
        let result = evaluator.evaluate(&RefreshKeySpec::sql("SELECT 1"), &at(0)).await;
        assert!(matches!(result, Err(EvaluationError::UnknownDataSource { .. })));
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let evaluator = RefreshKeyEvaluator::new(Arc::new(DriverRegistry::new()));
        let spec = RefreshKeySpec::manual("orders_import");

        assert_eq!(
            evaluator.evaluate(&spec, &at(0)).await.unwrap(),
            RefreshKeyValue::Sequence(0)
        );
        assert_eq!(evaluator.signal("orders_import"), 1);
        assert_eq!(
            evaluator.evaluate(&spec, &at(1_000)).await.unwrap(),
            RefreshKeyValue::Sequence(1)
        );
    }

    #[tokio::test]
    async fn test_invalidate_forces_reprobe() {
        let source = Arc::new(InMemorySource::new("default"));
        let evaluator = evaluator_with(Arc::clone(&source));
        let spec = RefreshKeySpec::sql("SELECT 1");

        evaluator.evaluate(&spec, &at(0)).await.unwrap();
        evaluator.invalidate(&spec, "default");
        evaluator.evaluate(&spec, &at(1)).await.unwrap();
        assert_eq!(source.probe_calls(), 2);
    }
}
