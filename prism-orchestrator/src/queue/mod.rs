//! Build Queue
//!
//! Bounded-concurrency priority queue of partition builds.
//!
//! - Waiting jobs leave in priority order, FIFO within a priority.
//! - At most one job per [`JobKey`] is in flight. A duplicate enqueue
//!   returns a handle to the existing job and promotes it if it is still
//!   waiting and the duplicate carries a higher priority.
//! - Transient failures are retried with exponential backoff; fatal
//!   failures and panics reach every waiter without retry.
//! - A read-only queue (external refresh) rejects every enqueue.
//!
//! # Usage
//!
//! ```ignore
//! let queue = BuildQueue::new(executor, BuildQueueConfig::from_config(&config));
//! let handle = queue.enqueue(BuildJob::new(key, QUERY_PRIORITY))?;
//! let output = handle.wait().await?;
//! ```

mod retry;

pub use retry::RetryPolicy;

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use prism_core::{
    validate_priority, BuildError, BuildJob, BuildOutput, JobKey, PrismConfig, PrismError,
    PrismResult,
};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

/// Outcome delivered to every waiter of a job.
pub type BuildResult = Result<BuildOutput, BuildError>;

/// Materializes one partition.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Build the job's partition and return the number of rows written.
    async fn execute(&self, job: &BuildJob) -> PrismResult<usize>;
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct BuildQueueConfig {
    /// Maximum builds running at once.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// How long a query waits on a build before `ContinueWait`.
    pub continue_wait_timeout: Duration,
    /// Reject every enqueue (builds happen in another process).
    pub read_only: bool,
}

impl Default for BuildQueueConfig {
    fn default() -> Self {
        Self::from_config(&PrismConfig::default())
    }
}

impl BuildQueueConfig {
    pub fn from_config(config: &PrismConfig) -> Self {
        let options = config.queue_options();
        Self {
            concurrency: options.concurrency.max(1),
            retry: RetryPolicy::from_options(options),
            continue_wait_timeout: options.continue_wait_timeout(),
            read_only: config.external_refresh(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Build queue counters since startup.
#[derive(Debug, Default)]
pub struct BuildQueueMetrics {
    pub enqueued: AtomicU64,
    /// Enqueues answered with an existing job.
    pub coalesced: AtomicU64,
    pub promoted: AtomicU64,
    pub started: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub retries: AtomicU64,
    pub cancelled: AtomicU64,
    /// Highest number of builds ever running at once.
    pub max_observed_concurrency: AtomicU64,
}

impl BuildQueueMetrics {
    pub fn snapshot(&self) -> BuildQueueSnapshot {
        BuildQueueSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            promoted: self.promoted.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            max_observed_concurrency: self.max_observed_concurrency.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildQueueSnapshot {
    pub enqueued: u64,
    pub coalesced: u64,
    pub promoted: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
    pub cancelled: u64,
    pub max_observed_concurrency: u64,
}

/// Keys currently running and waiting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub active: Vec<JobKey>,
    /// Waiting jobs in the order they will start.
    pub queued: Vec<(JobKey, i32)>,
}

// ============================================================================
// HANDLE
// ============================================================================

/// Waiter side of an enqueued job. Dropping it does not cancel the job.
#[derive(Debug, Clone)]
pub struct BuildHandle {
    key: JobKey,
    job_id: Uuid,
    rx: watch::Receiver<Option<BuildResult>>,
}

impl BuildHandle {
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Result if the job has finished.
    pub fn try_result(&self) -> Option<BuildResult> {
        (*self.rx.borrow()).clone()
    }

    pub async fn wait(mut self) -> BuildResult {
        self.recv().await
    }

    /// Wait up to `timeout`. A job still in flight yields
    /// [`BuildError::ContinueWait`] and keeps running.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> BuildResult {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(BuildError::ContinueWait {
                job: self.key.to_string(),
            }),
        }
    }

    async fn recv(&mut self) -> BuildResult {
        loop {
            let current = (*self.rx.borrow_and_update()).clone();
            if let Some(result) = current {
                return result;
            }
            if self.rx.changed().await.is_err() {
                return (*self.rx.borrow())
                    .clone()
                    .unwrap_or(Err(BuildError::QueueClosed));
            }
        }
    }
}

// ============================================================================
// QUEUE
// ============================================================================

struct Tracked {
    job: BuildJob,
    seq: u64,
    running: bool,
    tx: watch::Sender<Option<BuildResult>>,
}

/// Heap entry. Entries whose job was cancelled, started or promoted are
/// skipped when popped.
struct Waiting {
    priority: i32,
    seq: u64,
    key: JobKey,
}

impl PartialEq for Waiting {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiting {}

impl PartialOrd for Waiting {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiting {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then lower sequence.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    waiting: BinaryHeap<Waiting>,
    jobs: HashMap<JobKey, Tracked>,
    active: usize,
    next_seq: u64,
    closed: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    executor: Arc<dyn BuildExecutor>,
    config: BuildQueueConfig,
    metrics: BuildQueueMetrics,
}

/// Priority build queue.
#[derive(Clone)]
pub struct BuildQueue {
    inner: Arc<Inner>,
}

impl BuildQueue {
    pub fn new(executor: Arc<dyn BuildExecutor>, config: BuildQueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                executor,
                config,
                metrics: BuildQueueMetrics::default(),
            }),
        }
    }

    pub fn config(&self) -> &BuildQueueConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &BuildQueueMetrics {
        &self.inner.metrics
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.config.read_only
    }

    /// Enqueue `job`, or attach to the in-flight job with the same key.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, job: BuildJob) -> Result<BuildHandle, BuildError> {
        if self.inner.config.read_only {
            return Err(BuildError::RefreshDisabled {
                job: job.key.to_string(),
            });
        }
        validate_priority(job.priority)?;

        let handle = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if state.closed {
                return Err(BuildError::QueueClosed);
            }

            if let Some(tracked) = state.jobs.get_mut(&job.key) {
                self.inner.metrics.coalesced.fetch_add(1, Ordering::Relaxed);
                if !tracked.running && job.priority > tracked.job.priority {
                    tracing::debug!(
                        job = %job.key,
                        from = tracked.job.priority,
                        to = job.priority,
                        "Promoting queued build"
                    );
                    tracked.job.priority = job.priority;
                    state.waiting.push(Waiting {
                        priority: job.priority,
                        seq: tracked.seq,
                        key: job.key.clone(),
                    });
                    self.inner.metrics.promoted.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(BuildHandle {
                    key: job.key,
                    job_id: tracked.job.id,
                    rx: tracked.tx.subscribe(),
                });
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let (tx, rx) = watch::channel(None);
            let handle = BuildHandle {
                key: job.key.clone(),
                job_id: job.id,
                rx,
            };
            state.waiting.push(Waiting {
                priority: job.priority,
                seq,
                key: job.key.clone(),
            });
            tracing::debug!(job = %job.key, priority = job.priority, "Build enqueued");
            state.jobs.insert(
                job.key.clone(),
                Tracked {
                    job,
                    seq,
                    running: false,
                    tx,
                },
            );
            self.inner.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
            handle
        };

        self.inner.pump();
        Ok(handle)
    }

    /// Remove a job that has not started. Its waiters get `Cancelled`.
    pub fn cancel(&self, key: &JobKey) -> bool {
        let mut state = self.inner.lock();
        let queued = state.jobs.get(key).is_some_and(|t| !t.running);
        if !queued {
            return false;
        }
        if let Some(tracked) = state.jobs.remove(key) {
            tracked.tx.send_replace(Some(Err(BuildError::Cancelled {
                job: key.to_string(),
            })));
        }
        self.inner.metrics.cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::info!(job = %key, "Queued build cancelled");
        true
    }

    /// Stop accepting jobs and drop everything still waiting. Running jobs
    /// finish normally. Returns the number of dropped jobs.
    pub fn close(&self) -> usize {
        let mut state = self.inner.lock();
        state.closed = true;
        state.waiting.clear();
        let queued: Vec<JobKey> = state
            .jobs
            .iter()
            .filter(|(_, t)| !t.running)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &queued {
            if let Some(tracked) = state.jobs.remove(key) {
                tracked.tx.send_replace(Some(Err(BuildError::QueueClosed)));
            }
        }
        tracing::info!(dropped = queued.len(), "Build queue closed");
        queued.len()
    }

    pub fn is_in_flight(&self, key: &JobKey) -> bool {
        self.inner.lock().jobs.contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active
    }

    pub fn queued_count(&self) -> usize {
        self.inner.lock().jobs.values().filter(|t| !t.running).count()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.lock();
        let mut active: Vec<JobKey> = state
            .jobs
            .values()
            .filter(|t| t.running)
            .map(|t| t.job.key.clone())
            .collect();
        active.sort();
        let mut queued: Vec<(i32, u64, JobKey)> = state
            .jobs
            .values()
            .filter(|t| !t.running)
            .map(|t| (t.job.priority, t.seq, t.job.key.clone()))
            .collect();
        queued.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        QueueSnapshot {
            active,
            queued: queued.into_iter().map(|(p, _, k)| (k, p)).collect(),
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start waiting jobs while slots are free.
    fn pump(self: &Arc<Self>) {
        let mut to_start = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            while state.active < self.config.concurrency {
                let Some(next) = state.waiting.pop() else {
                    break;
                };
                let Some(tracked) = state.jobs.get_mut(&next.key) else {
                    continue;
                };
                if tracked.running
                    || tracked.seq != next.seq
                    || tracked.job.priority != next.priority
                {
                    continue;
                }
                tracked.running = true;
                state.active += 1;
                self.metrics
                    .max_observed_concurrency
                    .fetch_max(state.active as u64, Ordering::Relaxed);
                to_start.push(tracked.job.clone());
            }
        }

        for job in to_start {
            self.metrics.started.fetch_add(1, Ordering::Relaxed);
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.run(job).await });
        }
    }

    async fn run(self: Arc<Self>, mut job: BuildJob) {
        let started = Instant::now();
        let result = self.run_with_retry(&mut job).await;

        match &result {
            Ok(output) => {
                self.metrics.completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    job = %job.key,
                    rows = output.rows_written,
                    attempts = output.attempts,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Build completed"
                );
            }
            Err(e) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(job = %job.key, error = %e, "Build failed");
            }
        }

        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            if let Some(tracked) = state.jobs.remove(&job.key) {
                tracked.tx.send_replace(Some(result));
            }
        }
        self.pump();
    }

    async fn run_with_retry(&self, job: &mut BuildJob) -> BuildResult {
        loop {
            job.attempt += 1;
            let attempt = job.attempt;
            let outcome = AssertUnwindSafe(self.executor.execute(job))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(rows_written)) => {
                    return Ok(BuildOutput {
                        key: job.key.clone(),
                        job_id: job.id,
                        rows_written,
                        refresh_key: job.refresh_key.clone(),
                        built_at: Utc::now(),
                        attempts: attempt,
                    });
                }
                Ok(Err(e)) if self.config.retry.should_retry(&e, attempt) => {
                    let delay = self.config.retry.backoff(attempt - 1);
                    self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        job = %job.key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Build attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(e)) => return Err(classify_failure(job, e)),
                Err(_) => {
                    return Err(BuildError::Fatal {
                        job: job.key.to_string(),
                        reason: "build executor panicked".to_string(),
                    })
                }
            }
        }
    }
}

fn classify_failure(job: &BuildJob, error: PrismError) -> BuildError {
    match error {
        PrismError::Build(e) => e,
        e if e.is_transient() => BuildError::Transient {
            job: job.key.to_string(),
            attempts: job.attempt,
            reason: e.to_string(),
        },
        e => BuildError::Fatal {
            job: job.key.to_string(),
            reason: e.to_string(),
        },
    }
}

// =============================================================================
// TESTS
// =============================================================================
