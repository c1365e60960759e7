//! Coalescing query result cache.
//!
//! Maps a [`ScopedFingerprint`] to either a ready result (tagged with the
//! refresh key value it was computed against) or an in-flight computation.
//!
//! # Coalescing
//!
//! The first caller for a fingerprint spawns the computation as an owned
//! tokio task and stores a shared handle to it. Every later caller attaches
//! to the same handle, so at most one computation per fingerprint runs at a
//! time and a caller dropping its future never cancels the work.
//!
//! # Single writer
//!
//! Each computation carries a generation id. When it completes it only
//! touches the entry if that entry still holds its own generation; an entry
//! that was invalidated or replaced in the meantime is left alone.

use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use prism_core::{
    BuildError, PrismError, PrismResult, QueryCacheOptions, RefreshKeyContext, RefreshKeySpec,
    RefreshKeyValue, ScopedFingerprint, StorageError, Timestamp,
};

use super::freshness::{CacheRead, ReadSource};
use super::refresh_key::RefreshKeyEvaluator;
use super::stats::{CacheCounters, CacheStats};

/// Configuration for the query cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries before least-recently-used ready entries are evicted.
    pub capacity: NonZeroUsize,
    /// Ready entries older than this are recomputed even if the refresh key
    /// still matches.
    pub expire_after: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from_options(&QueryCacheOptions::default())
    }
}

impl CacheConfig {
    pub fn from_options(options: &QueryCacheOptions) -> Self {
        Self {
            capacity: NonZeroUsize::new(options.capacity).unwrap_or(NonZeroUsize::MIN),
            expire_after: Duration::from_secs(options.expire_secs),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        self
    }

    pub fn with_expire_after(mut self, expire_after: Duration) -> Self {
        self.expire_after = expire_after;
        self
    }
}

/// Per-lookup flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupOptions {
    /// Recompute even when a matching ready entry exists.
    pub renew: bool,
}

type SharedCompute<V> = Shared<BoxFuture<'static, PrismResult<V>>>;

#[derive(Clone)]
struct ReadyEntry<V> {
    value: V,
    refresh_key: RefreshKeyValue,
    computed_at: Timestamp,
}

enum Entry<V: Clone> {
    Pending {
        generation: u64,
        refresh_key: RefreshKeyValue,
        started_at: Timestamp,
        future: SharedCompute<V>,
    },
    Ready(ReadyEntry<V>),
}

impl<V: Clone> Entry<V> {
    fn is_pending(&self) -> bool {
        matches!(self, Entry::Pending { .. })
    }
}

struct Entries<V: Clone> {
    lru: LruCache<ScopedFingerprint, Entry<V>>,
    next_generation: u64,
}

struct Inner<V: Clone> {
    entries: Mutex<Entries<V>>,
    evaluator: Arc<RefreshKeyEvaluator>,
    config: CacheConfig,
    counters: CacheCounters,
}

/// What a lookup decided while holding the lock.
enum Plan<V: Clone> {
    Hit(ReadyEntry<V>),
    Attach(SharedCompute<V>, RefreshKeyValue, Timestamp),
    Compute(SharedCompute<V>),
    /// Caller holds an older key than the ready entry; computed without
    /// touching the cache.
    Detached(BoxFuture<'static, PrismResult<V>>),
}

/// Query result cache.
///
/// # Example
///
/// ```ignore
/// let cache = QueryCache::new(evaluator, CacheConfig::default());
/// let read = cache
///     .get_or_compute(key, &RefreshKeySpec::every(60), &ctx, move || async move {
///         source.execute(&query, None).await.map_err(Into::into)
///     })
///     .await?;
/// ```
pub struct QueryCache<V: Clone + Send + Sync + 'static> {
    inner: Arc<Inner<V>>,
}

impl<V: Clone + Send + Sync + 'static> Clone for QueryCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> QueryCache<V> {
    pub fn new(evaluator: Arc<RefreshKeyEvaluator>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Entries {
                    lru: LruCache::unbounded(),
                    next_generation: 0,
                }),
                evaluator,
                config,
                counters: CacheCounters::default(),
            }),
        }
    }

    pub fn evaluator(&self) -> &Arc<RefreshKeyEvaluator> {
        &self.inner.evaluator
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Evaluate `spec`, then serve or compute.
    ///
    /// If evaluation fails and a ready entry exists, that entry is served
    /// and marked stale. A pending entry is attached to. Otherwise the
    /// evaluation error is returned.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: ScopedFingerprint,
        spec: &RefreshKeySpec,
        context: &RefreshKeyContext,
        compute: F,
    ) -> PrismResult<CacheRead<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PrismResult<V>> + Send + 'static,
    {
        match self.inner.evaluator.evaluate(spec, context).await {
            Ok(value) => {
                self.lookup(key, value, context.now, LookupOptions::default(), compute)
                    .await
            }
            Err(e) => {
                let fallback = {
                    let mut entries = self.inner.lock()?;
                    match entries.lru.get(&key) {
                        Some(Entry::Ready(ready)) => Some(Plan::Hit(ready.clone())),
                        Some(Entry::Pending {
                            future,
                            refresh_key,
                            started_at,
                            ..
                        }) => Some(Plan::Attach(future.clone(), refresh_key.clone(), *started_at)),
                        None => None,
                    }
                };
                match fallback {
                    Some(Plan::Hit(ready)) => {
                        CacheCounters::bump(&self.inner.counters.stale_served);
                        tracing::warn!(
                            key = %key,
                            error = %e,
                            "Refresh key evaluation failed, serving cached result"
                        );
                        Ok(CacheRead::new(
                            ready.value,
                            Some(ready.refresh_key),
                            ready.computed_at,
                            ReadSource::Stale,
                        ))
                    }
                    Some(Plan::Attach(future, refresh_key, started_at)) => {
                        CacheCounters::bump(&self.inner.counters.coalesced);
                        let value = future.await?;
                        Ok(CacheRead::new(
                            value,
                            Some(refresh_key),
                            started_at,
                            ReadSource::Coalesced,
                        ))
                    }
                    _ => Err(e.into()),
                }
            }
        }
    }

    /// Serve or compute against an already known refresh key value.
    ///
    /// Used for targets whose freshness is derived, such as a rollup whose
    /// value combines its partitions' keys.
    pub async fn get_or_compute_at<F, Fut>(
        &self,
        key: ScopedFingerprint,
        refresh_key: RefreshKeyValue,
        now: Timestamp,
        compute: F,
    ) -> PrismResult<CacheRead<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PrismResult<V>> + Send + 'static,
    {
        self.lookup(key, refresh_key, now, LookupOptions::default(), compute)
            .await
    }

    /// Recompute even if a matching ready entry exists.
    pub async fn renew<F, Fut>(
        &self,
        key: ScopedFingerprint,
        refresh_key: RefreshKeyValue,
        now: Timestamp,
        compute: F,
    ) -> PrismResult<CacheRead<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PrismResult<V>> + Send + 'static,
    {
        self.lookup(key, refresh_key, now, LookupOptions { renew: true }, compute)
            .await
    }

    /// Run `compute` without reading or writing the cache.
    pub async fn force_no_cache<F, Fut>(&self, now: Timestamp, compute: F) -> PrismResult<CacheRead<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PrismResult<V>> + Send + 'static,
    {
        CacheCounters::bump(&self.inner.counters.bypassed);
        let value = compute().await?;
        Ok(CacheRead::new(value, None, now, ReadSource::Bypassed))
    }

    /// Core lookup.
    ///
    /// `now` is the logical request time; it is recorded as the entry's
    /// compute time and used for expiry.
    pub async fn lookup<F, Fut>(
        &self,
        key: ScopedFingerprint,
        refresh_key: RefreshKeyValue,
        now: Timestamp,
        options: LookupOptions,
        compute: F,
    ) -> PrismResult<CacheRead<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PrismResult<V>> + Send + 'static,
    {
        let plan = {
            let mut entries = self.inner.lock()?;
            let existing = match entries.lru.get(&key) {
                Some(Entry::Ready(ready))
                    if !options.renew
                        && ready.refresh_key == refresh_key
                        && !self.inner.is_expired(ready, now) =>
                {
                    Some(Plan::Hit(ready.clone()))
                }
                Some(Entry::Pending {
                    future,
                    refresh_key: pending_key,
                    started_at,
                    ..
                }) => Some(Plan::Attach(future.clone(), pending_key.clone(), *started_at)),
                _ => None,
            };
            let superseded = matches!(
                entries.lru.peek(&key),
                Some(Entry::Ready(ready)) if refresh_key.is_older_than(&ready.refresh_key)
            );
            match existing {
                Some(plan) => plan,
                None if superseded => Plan::Detached(compute().boxed()),
                None => {
                    let generation = entries.next_generation;
                    entries.next_generation += 1;
                    let future = self.spawn_compute(key.clone(), generation, refresh_key.clone(), now, compute());
                    entries.lru.put(
                        key.clone(),
                        Entry::Pending {
                            generation,
                            refresh_key: refresh_key.clone(),
                            started_at: now,
                            future: future.clone(),
                        },
                    );
                    let evicted = evict_over_capacity(&mut entries.lru, self.inner.config.capacity.get());
                    self.inner.counters.evictions.fetch_add(evicted, std::sync::atomic::Ordering::Relaxed);
                    Plan::Compute(future)
                }
            }
        };

        match plan {
            Plan::Hit(ready) => {
                CacheCounters::bump(&self.inner.counters.hits);
                tracing::debug!(key = %key, refresh_key = %ready.refresh_key, "Query cache hit");
                Ok(CacheRead::new(
                    ready.value,
                    Some(ready.refresh_key),
                    ready.computed_at,
                    ReadSource::Hit,
                ))
            }
            Plan::Attach(future, pending_key, started_at) => {
                CacheCounters::bump(&self.inner.counters.coalesced);
                tracing::debug!(key = %key, "Attaching to in-flight computation");
                let value = future.await?;
                Ok(CacheRead::new(
                    value,
                    Some(pending_key),
                    started_at,
                    ReadSource::Coalesced,
                ))
            }
            Plan::Detached(future) => {
                CacheCounters::bump(&self.inner.counters.misses);
                tracing::debug!(
                    key = %key,
                    refresh_key = %refresh_key,
                    "Refresh key older than cached entry, computing without caching"
                );
                let value = future.await?;
                Ok(CacheRead::new(value, Some(refresh_key), now, ReadSource::Computed))
            }
            Plan::Compute(future) => {
                CacheCounters::bump(&self.inner.counters.misses);
                tracing::debug!(key = %key, refresh_key = %refresh_key, "Query cache miss");
                let value = future.await?;
                Ok(CacheRead::new(value, Some(refresh_key), now, ReadSource::Computed))
            }
        }
    }

    fn spawn_compute<Fut>(
        &self,
        key: ScopedFingerprint,
        generation: u64,
        refresh_key: RefreshKeyValue,
        now: Timestamp,
        compute: Fut,
    ) -> SharedCompute<V>
    where
        Fut: Future<Output = PrismResult<V>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = match AssertUnwindSafe(compute).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(PrismError::Build(BuildError::Fatal {
                    job: task_key.to_string(),
                    reason: "query computation panicked".to_string(),
                })),
            };
            inner.resolve(&task_key, generation, refresh_key, now, &result);
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(PrismError::Build(BuildError::Fatal {
                    job: key.to_string(),
                    reason: format!("query computation aborted: {}", e),
                })),
            }
        }
        .boxed()
        .shared()
    }

    /// Ready value for `key`, if any, without computing.
    pub fn result_if_exists(&self, key: &ScopedFingerprint) -> Option<CacheRead<V>> {
        let mut entries = self.inner.lock().ok()?;
        match entries.lru.get(key) {
            Some(Entry::Ready(ready)) => Some(CacheRead::new(
                ready.value.clone(),
                Some(ready.refresh_key.clone()),
                ready.computed_at,
                ReadSource::Hit,
            )),
            _ => None,
        }
    }

    /// When the ready value for `key` was computed.
    pub fn last_refresh_time(&self, key: &ScopedFingerprint) -> Option<Timestamp> {
        let entries = self.inner.lock().ok()?;
        match entries.lru.peek(key) {
            Some(Entry::Ready(ready)) => Some(ready.computed_at),
            _ => None,
        }
    }

    /// Whether a computation for `key` is in flight.
    pub fn is_pending(&self, key: &ScopedFingerprint) -> bool {
        self.inner
            .lock()
            .map(|entries| entries.lru.peek(key).is_some_and(Entry::is_pending))
            .unwrap_or(false)
    }

    /// Remove the entry for `key`. An in-flight computation keeps running
    /// but its result is discarded.
    pub fn invalidate(&self, key: &ScopedFingerprint) -> bool {
        self.inner
            .lock()
            .map(|mut entries| entries.lru.pop(key).is_some())
            .unwrap_or(false)
    }

    /// Remove every entry of one application. Returns the number removed.
    pub fn invalidate_app(&self, app_id: &str) -> usize {
        let Ok(mut entries) = self.inner.lock() else {
            return 0;
        };
        let doomed: Vec<ScopedFingerprint> = entries
            .lru
            .iter()
            .filter(|(k, _)| k.app_id() == app_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.lru.pop(key);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|e| e.lru.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot(self.len() as u64)
    }
}

impl<V: Clone> Inner<V> {
    fn lock(&self) -> PrismResult<MutexGuard<'_, Entries<V>>> {
        self.entries
            .lock()
            .map_err(|_| PrismError::Storage(StorageError::LockPoisoned))
    }

    fn is_expired(&self, ready: &ReadyEntry<V>, now: Timestamp) -> bool {
        (now - ready.computed_at)
            .to_std()
            .map(|age| age >= self.config.expire_after)
            .unwrap_or(false)
    }

    /// Transition the entry created by `generation` to its final state.
    fn resolve(
        &self,
        key: &ScopedFingerprint,
        generation: u64,
        refresh_key: RefreshKeyValue,
        computed_at: Timestamp,
        result: &PrismResult<V>,
    ) {
        let Ok(mut entries) = self.lock() else {
            return;
        };
        let owns_entry = matches!(
            entries.lru.peek(key),
            Some(Entry::Pending { generation: g, .. }) if *g == generation
        );
        if !owns_entry {
            return;
        }
        match result {
            Ok(value) => {
                if let Some(entry) = entries.lru.peek_mut(key) {
                    *entry = Entry::Ready(ReadyEntry {
                        value: value.clone(),
                        refresh_key,
                        computed_at,
                    });
                }
                let evicted = evict_over_capacity(&mut entries.lru, self.config.capacity.get());
                self.counters
                    .evictions
                    .fetch_add(evicted, std::sync::atomic::Ordering::Relaxed);
            }
            Err(e) => {
                entries.lru.pop(key);
                tracing::warn!(key = %key, error = %e, "Query computation failed, entry dropped");
            }
        }
    }
}

/// Pop least-recently-used ready entries until within `capacity`.
///
/// Pending entries are skipped, so the cache may temporarily exceed its
/// capacity while many computations are in flight.
fn evict_over_capacity<V: Clone>(
    lru: &mut LruCache<ScopedFingerprint, Entry<V>>,
    capacity: usize,
) -> u64 {
    let mut evicted = 0;
    while lru.len() > capacity {
        // iter() runs most- to least-recently used.
        let victim = lru
            .iter()
            .rev()
            .find(|(_, entry)| !entry.is_pending())
            .map(|(k, _)| k.clone());
        match victim {
            Some(k) => {
                lru.pop(&k);
                evicted += 1;
            }
            None => break,
        }
    }
    evicted
}

// =============================================================================
// TESTS
// =============================================================================
