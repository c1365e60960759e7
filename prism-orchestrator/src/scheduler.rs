//! Refresh Scheduler Background Task
//!
//! Periodically walks every registered pre-aggregation, evaluates its
//! refresh key and enqueues background builds for partitions that were never
//! built or were built against a different key.
//!
//! - Rollup-only descriptors are never refreshed here.
//! - With external refresh enabled nothing is enqueued; another process
//!   owns the builds.
//! - Partitions already queued or running are skipped.
//! - Built partitions entirely outside a descriptor's update window are
//!   left alone.
//! - Cycles never overlap. A cycle requested while another runs is skipped
//!   and reported as such.
//!
//! # Usage
//!
//! ```ignore
//! let scheduler = RefreshScheduler::new(registry, queue, evaluator, SchedulerConfig::from_config(&config));
//! let handle = scheduler.start();
//! // ...
//! handle.stop().await;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use prism_core::{
    BuildJob, JobKey, PreAggregationDescriptor, PrismConfig, PrismResult, RefreshKeyContext,
    TimeRange, Timestamp, BACKGROUND_PRIORITY,
};
use prism_storage::RefreshKeyEvaluator;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::queue::BuildQueue;
use crate::registry::PreAggregationRegistry;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between cycles (`processSubscriptionsInterval`).
    pub interval: Duration,
    /// Builds happen in another process.
    pub external_refresh: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_config(&PrismConfig::default())
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &PrismConfig) -> Self {
        Self {
            interval: config.scheduler_interval(),
            external_refresh: config.external_refresh(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Scheduler counters since startup.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub cycles_completed: AtomicU64,
    /// Cycles not run because another cycle was in progress.
    pub cycles_skipped: AtomicU64,
    pub jobs_enqueued: AtomicU64,
    pub errors: AtomicU64,
}

impl SchedulerMetrics {
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    pub cycles_completed: u64,
    pub cycles_skipped: u64,
    pub jobs_enqueued: u64,
    pub errors: u64,
}

/// Outcome of one refresh cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Another cycle was running; nothing was checked.
    pub skipped: bool,
    pub descriptors_checked: usize,
    pub jobs_enqueued: usize,
    pub skipped_in_flight: usize,
    pub skipped_outside_window: usize,
    pub skipped_rollup_only: usize,
    pub up_to_date: usize,
    /// Descriptors whose refresh failed.
    pub errors: usize,
}

// ============================================================================
// SCHEDULER
// ============================================================================

struct Inner {
    registry: Arc<PreAggregationRegistry>,
    queue: BuildQueue,
    evaluator: Arc<RefreshKeyEvaluator>,
    config: SchedulerConfig,
    metrics: SchedulerMetrics,
    cycle_running: AtomicBool,
}

/// Resets the cycle flag however the cycle ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<Inner>,
}

impl RefreshScheduler {
    pub fn new(
        registry: Arc<PreAggregationRegistry>,
        queue: BuildQueue,
        evaluator: Arc<RefreshKeyEvaluator>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                queue,
                evaluator,
                config,
                metrics: SchedulerMetrics::default(),
                cycle_running: AtomicBool::new(false),
            }),
        }
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.inner.metrics
    }

    /// Spawn the periodic task. Must be called from within a tokio runtime.
    pub fn start(&self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(scheduler_loop(inner, shutdown_rx));
        SchedulerHandle { shutdown_tx, task }
    }

    /// Run one cycle as of `now`.
    pub async fn run_cycle(&self, now: Timestamp) -> CycleReport {
        self.inner.run_cycle(now).await
    }
}

/// Running scheduler. Dropping it also stops the task.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal shutdown and wait for the current cycle to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Refresh scheduler task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn scheduler_loop(inner: Arc<Inner>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = interval(inner.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_ms = inner.config.interval.as_millis() as u64,
        external_refresh = inner.config.external_refresh,
        "Refresh scheduler started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Refresh scheduler shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                inner.run_cycle(Utc::now()).await;
            }
        }
    }

    let snapshot = inner.metrics.snapshot();
    tracing::info!(
        cycles_completed = snapshot.cycles_completed,
        cycles_skipped = snapshot.cycles_skipped,
        jobs_enqueued = snapshot.jobs_enqueued,
        errors = snapshot.errors,
        "Refresh scheduler stopped"
    );
}

impl Inner {
    async fn run_cycle(&self, now: Timestamp) -> CycleReport {
        let mut report = CycleReport::default();
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.metrics.cycles_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Refresh cycle already running, skipping");
            report.skipped = true;
            return report;
        }
        let _guard = CycleGuard(&self.cycle_running);

        if self.config.external_refresh {
            tracing::trace!("External refresh enabled, nothing to schedule");
            self.metrics.cycles_completed.fetch_add(1, Ordering::Relaxed);
            return report;
        }

        for descriptor in self.registry.descriptors() {
            if descriptor.rollup_only {
                report.skipped_rollup_only += 1;
                continue;
            }
            report.descriptors_checked += 1;
            if let Err(e) = self.refresh_descriptor(&descriptor, now, &mut report).await {
                report.errors += 1;
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    pre_aggregation = %descriptor.id,
                    error = %e,
                    "Failed to refresh pre-aggregation"
                );
            }
        }

        self.metrics.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .jobs_enqueued
            .fetch_add(report.jobs_enqueued as u64, Ordering::Relaxed);
        if report.jobs_enqueued > 0 || report.errors > 0 {
            tracing::info!(
                descriptors = report.descriptors_checked,
                enqueued = report.jobs_enqueued,
                in_flight = report.skipped_in_flight,
                outside_window = report.skipped_outside_window,
                errors = report.errors,
                "Refresh cycle completed"
            );
        } else {
            tracing::trace!("Refresh cycle completed with nothing to build");
        }
        report
    }

    async fn refresh_descriptor(
        &self,
        descriptor: &PreAggregationDescriptor,
        now: Timestamp,
        report: &mut CycleReport,
    ) -> PrismResult<()> {
        let context = RefreshKeyContext::new(now, descriptor.data_source.clone());
        let value = self
            .evaluator
            .evaluate(&descriptor.refresh_key, &context)
            .await?;
        let window = update_window(descriptor, now);
        let priority = descriptor.priority.unwrap_or(BACKGROUND_PRIORITY);

        for partition in descriptor.partitions() {
            let key = JobKey::new(descriptor.id.clone(), partition.key.clone());
            if self.queue.is_in_flight(&key) {
                report.skipped_in_flight += 1;
                continue;
            }
            let Some(state) = self.registry.partition_state(&descriptor.id, &partition.key) else {
                continue;
            };
            if let (Some(window), Some(range), true) =
                (window, partition.range, state.built_at.is_some())
            {
                if !range.overlaps(&window) {
                    report.skipped_outside_window += 1;
                    continue;
                }
            }
            if state.is_current(&value) {
                report.up_to_date += 1;
                continue;
            }

            self.registry.mark_stale(&descriptor.id, &partition.key);
            self.queue
                .enqueue(BuildJob::new(key, priority).with_refresh_key(value.clone()))?;
            report.jobs_enqueued += 1;
        }
        Ok(())
    }
}

/// `[now - update_window, now)` for descriptors that have one.
fn update_window(descriptor: &PreAggregationDescriptor, now: Timestamp) -> Option<TimeRange> {
    let window = chrono::Duration::from_std(descriptor.update_window?).ok()?;
    TimeRange::new(now - window, now).ok()
}

// =============================================================================
// TESTS
// =============================================================================
