//! Keyed query-result cache with coalescing refetch.
//!
//! Each [`CacheKey`] has at most one entry. An entry holds the registered
//! fetcher, the last successful value, and the refetch bookkeeping:
//!
//! ```text
//!            get (first)                 fetch ok
//!   Empty ───────────────→ Loading ─────────────────→ Loaded
//!                                                    │    ↑
//!                                        invalidate  │    │ fetch ok
//!                                                    ↓    │
//!                                              Refreshing (stale)
//! ```
//!
//! At most one fetch per key is in flight. An invalidation that arrives while
//! one is running is recorded as pending, since the running fetch may already
//! have read the backend. Pending invalidations keep the value stale and are
//! drained by a single follow-up fetch: right away under
//! `CoalescePolicy::Trailing` (the default), or on the next read under
//! `CoalescePolicy::Absorb`.
//!
//! The entry map sits behind a `std::sync::Mutex` that is never held across
//! an `.await`. Fetches run on spawned tasks.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use palika_core::{
    CacheKey, CachePolicyConfig, CoalescePolicy, FetchError, PalikaError, PalikaResult, Record,
    Timestamp,
};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::cached::{CacheLookup, CachedResult, QueryValue};
use super::traits::{CacheStats, QueryFetcher};

struct Entry {
    fetcher: Option<Arc<dyn QueryFetcher>>,
    value: Option<(QueryValue, Timestamp)>,
    stale: bool,
    /// A reader asked for this key. Registering a fetcher afterwards starts
    /// the initial load.
    requested: bool,
    /// Invalidated since the running fetch started; another fetch is owed.
    pending: bool,
    fetches: u64,
    last_error: Option<FetchError>,
    /// `true` while a fetch task owns this key.
    fetching: watch::Sender<bool>,
}

impl Entry {
    fn new() -> Self {
        let (fetching, _) = watch::channel(false);
        Self {
            fetcher: None,
            value: None,
            stale: false,
            requested: false,
            pending: false,
            fetches: 0,
            last_error: None,
            fetching,
        }
    }

    fn in_flight(&self) -> bool {
        *self.fetching.borrow()
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
}

struct CacheInner {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    policy: CoalescePolicy,
    counters: Counters,
}

impl CacheInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, Entry>> {
        // Entries stay consistent across a panic: every mutation is a plain
        // field store.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a fetch for `key`. Caller holds the entry lock.
    fn begin_fetch(self: &Arc<Self>, key: &CacheKey, entry: &mut Entry) -> bool {
        let Some(fetcher) = entry.fetcher.clone() else {
            return false;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(key = %key, "no async runtime, fetch not started");
                entry.last_error = Some(FetchError::QueryFailed {
                    key: key.clone(),
                    reason: "no async runtime".to_string(),
                });
                return false;
            }
        };

        entry.fetching.send_replace(true);
        entry.pending = false;
        entry.fetches += 1;
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, fetcher = %fetcher.describe(), stale = entry.stale, "fetch started");

        let inner = Arc::clone(self);
        let key = key.clone();
        runtime.spawn(async move {
            let mut fetcher = fetcher;
            loop {
                let result = run_isolated(&key, Arc::clone(&fetcher)).await;
                match inner.complete(&key, result) {
                    Some(next) => fetcher = next,
                    None => break,
                }
            }
        });
        true
    }

    /// Record a fetch outcome. Returns the fetcher to run again when a
    /// follow-up fetch is owed now.
    fn complete(
        &self,
        key: &CacheKey,
        result: PalikaResult<QueryValue>,
    ) -> Option<Arc<dyn QueryFetcher>> {
        let mut entries = self.entries();
        let entry = entries.get_mut(key)?;

        match result {
            Ok(value) => {
                debug!(key = %key, kind = value.kind(), "fetch completed");
                entry.value = Some((value, Utc::now()));
                entry.stale = entry.pending;
                entry.last_error = None;
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                let err = match err {
                    PalikaError::Fetch(err) => err,
                    other => FetchError::QueryFailed {
                        key: key.clone(),
                        reason: other.to_string(),
                    },
                };
                warn!(
                    key = %key,
                    error = %err,
                    has_value = entry.value.is_some(),
                    "fetch failed, keeping last known value"
                );
                entry.last_error = Some(err);
            }
        }

        if entry.pending {
            match (self.policy, entry.fetcher.clone()) {
                (CoalescePolicy::Trailing, Some(fetcher)) => {
                    entry.pending = false;
                    entry.fetches += 1;
                    self.counters.fetches.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "follow-up fetch started");
                    return Some(fetcher);
                }
                _ => {
                    debug!(key = %key, "value may predate a change, next read refetches");
                }
            }
        }

        entry.fetching.send_replace(false);
        None
    }
}

/// Run one fetch on its own task so a panicking fetcher cannot leave the key
/// stuck in flight.
async fn run_isolated(key: &CacheKey, fetcher: Arc<dyn QueryFetcher>) -> PalikaResult<QueryValue> {
    match tokio::spawn(async move { fetcher.fetch().await }).await {
        Ok(result) => result,
        Err(join) => Err(FetchError::QueryFailed {
            key: key.clone(),
            reason: format!("fetch task failed: {}", join),
        }
        .into()),
    }
}

/// Shared query cache.
///
/// Cloning is cheap and every clone sees the same entries.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::with_policy(CoalescePolicy::default())
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("policy", &self.inner.policy)
            .field("entries", &self.inner.entries().len())
            .finish()
    }
}

impl QueryCache {
    pub fn new(config: &CachePolicyConfig) -> Self {
        Self::with_policy(config.coalesce)
    }

    pub fn with_policy(policy: CoalescePolicy) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                policy,
                counters: Counters::default(),
            }),
        }
    }

    pub fn policy(&self) -> CoalescePolicy {
        self.inner.policy
    }

    /// Register how to compute `key`.
    ///
    /// Registering again replaces the fetcher; a fetch already in flight
    /// finishes with the old one. A cached value is kept as is. If a reader
    /// already asked for the key, the initial load starts now.
    pub fn set(&self, key: CacheKey, fetcher: Arc<dyn QueryFetcher>) {
        let mut entries = self.inner.entries();
        let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
        let replaced = entry.fetcher.replace(fetcher).is_some();
        debug!(key = %key, replaced, "fetcher registered");

        if entry.requested && entry.fetches == 0 && !entry.in_flight() {
            self.inner.begin_fetch(&key, entry);
        }
    }

    /// Read the cached value for `key`.
    ///
    /// The first read of a registered key starts the initial load and
    /// returns `Pending`. A value that exists is always returned, with its
    /// staleness flag. A read also starts a fetch still owed for an
    /// invalidation that landed mid-fetch.
    pub fn get(&self, key: &CacheKey) -> CacheLookup<QueryValue> {
        let mut entries = self.inner.entries();
        let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
        entry.requested = true;

        if entry.pending && !entry.in_flight() {
            self.inner.begin_fetch(key, entry);
        }

        if let Some((value, fetched_at)) = &entry.value {
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            return CacheLookup::Ready(CachedResult::new(value.clone(), entry.stale, *fetched_at));
        }

        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        if entry.fetches == 0 && !entry.in_flight() {
            self.inner.begin_fetch(key, entry);
        }
        CacheLookup::Pending
    }

    /// Read `key` and extract a typed value from it.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::TypeMismatch` when the cached value has a
    /// different shape than `extract` accepts.
    pub fn get_typed<T>(
        &self,
        key: &CacheKey,
        expected: &str,
        extract: impl FnOnce(QueryValue) -> Option<T>,
    ) -> Result<Option<CachedResult<T>>, FetchError> {
        let Some(result) = self.get(key).ready() else {
            return Ok(None);
        };
        let stale = result.is_stale();
        let fetched_at = result.fetched_at();
        match extract(result.into_value()) {
            Some(value) => Ok(Some(CachedResult::new(value, stale, fetched_at))),
            None => Err(FetchError::TypeMismatch {
                key: key.clone(),
                expected: expected.to_string(),
            }),
        }
    }

    /// Cached count for `key`. `None` while pending or when the key does not
    /// hold a count.
    pub fn get_count(&self, key: &CacheKey) -> Option<CachedResult<u64>> {
        self.get_typed(key, "count", |value| value.as_count())
            .unwrap_or_else(|err| {
                warn!(error = %err, "cached value has unexpected shape");
                None
            })
    }

    /// Cached records for `key`. `None` while pending or when the key does
    /// not hold records.
    pub fn get_records(&self, key: &CacheKey) -> Option<CachedResult<Vec<Record>>> {
        self.get_typed(key, "records", QueryValue::into_records)
            .unwrap_or_else(|err| {
                warn!(error = %err, "cached value has unexpected shape");
                None
            })
    }

    /// Mark `key` stale and schedule a refetch.
    ///
    /// Returns `true` when a new fetch was started. Invalidating a key that
    /// was never loaded issues no query. Invalidating while a fetch is in
    /// flight never starts a second concurrent fetch.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut entries = self.inner.entries();
        let Some(entry) = entries.get_mut(key) else {
            debug!(key = %key, "invalidate: nothing cached");
            return false;
        };

        if entry.value.is_some() {
            entry.stale = true;
        }

        if entry.in_flight() {
            let first = !entry.pending;
            entry.pending = true;
            if first && self.inner.policy == CoalescePolicy::Trailing {
                debug!(key = %key, "invalidate: follow-up fetch owed");
            } else {
                self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "invalidate: coalesced into pending fetch");
            }
            return false;
        }

        if entry.fetches == 0 {
            debug!(key = %key, "invalidate: never loaded");
            return false;
        }

        self.inner.begin_fetch(key, entry)
    }

    /// Invalidate every key in `keys`. Returns how many fetches started.
    pub fn invalidate_all<'a, I>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        keys.into_iter().filter(|key| self.invalidate(key)).count()
    }

    /// Start a fetch for `key` unless one is already running.
    ///
    /// Unlike [`invalidate`](Self::invalidate) this also retries a key whose
    /// initial load failed.
    pub fn refetch(&self, key: &CacheKey) -> bool {
        let mut entries = self.inner.entries();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if entry.in_flight() {
            return false;
        }
        if entry.value.is_some() {
            entry.stale = true;
        }
        self.inner.begin_fetch(key, entry)
    }

    /// Resolve once no fetch for `key` is in flight.
    pub async fn settled(&self, key: &CacheKey) {
        let rx = {
            let entries = self.inner.entries();
            match entries.get(key) {
                Some(entry) => entry.fetching.subscribe(),
                None => return,
            }
        };
        wait_idle(rx).await;
    }

    /// Resolve once every fetch that was in flight at call time has ended.
    pub async fn settle_all(&self) {
        let receivers: Vec<_> = {
            let entries = self.inner.entries();
            entries
                .values()
                .filter(|entry| entry.in_flight())
                .map(|entry| entry.fetching.subscribe())
                .collect()
        };
        for rx in receivers {
            wait_idle(rx).await;
        }
    }

    /// Error recorded by the most recent failed fetch, cleared on success.
    pub fn last_error(&self, key: &CacheKey) -> Option<FetchError> {
        self.inner
            .entries()
            .get(key)
            .and_then(|entry| entry.last_error.clone())
    }

    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.inner
            .entries()
            .get(key)
            .map(Entry::in_flight)
            .unwrap_or(false)
    }

    /// Number of fetches started for `key`, trailing ones included.
    pub fn fetch_count(&self, key: &CacheKey) -> u64 {
        self.inner
            .entries()
            .get(key)
            .map(|entry| entry.fetches)
            .unwrap_or(0)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner
            .entries()
            .get(key)
            .map(|entry| entry.value.is_some())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.inner.counters;
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            fetches: counters.fetches.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            entry_count: self.inner.entries().len() as u64,
        }
    }
}

async fn wait_idle(mut rx: watch::Receiver<bool>) {
    // A closed channel means the entry is gone, which is as idle as it gets.
    let _ = rx.wait_for(|fetching| !*fetching).await;
}

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        /// A burst of any size landing while a refetch is in flight costs
        /// exactly one refetch under the absorbing policy.
        #[test]
        fn prop_burst_costs_one_refetch(burst in 1usize..40) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let fetches = rt.block_on(async move {
                let cache = QueryCache::with_policy(CoalescePolicy::Absorb);
                let k = CacheKey::single("admin-badge-issues");
                let (gate, _) = watch::channel(true);
                let gate = Arc::new(gate);
                let fetch_gate = Arc::clone(&gate);
                cache.set(
                    k.clone(),
                    Arc::new(super::super::FnFetcher::new(move || {
                        let mut rx = fetch_gate.subscribe();
                        async move {
                            let _ = rx.wait_for(|open| *open).await;
                            Ok::<_, PalikaError>(QueryValue::Count(1))
                        }
                    })),
                );
                cache.get(&k);
                cache.settled(&k).await;

                gate.send_replace(false);
                for _ in 0..burst {
                    cache.invalidate(&k);
                }
                gate.send_replace(true);
                cache.settled(&k).await;
                cache.fetch_count(&k)
            });
            prop_assert_eq!(fetches, 2);
        }

        /// Under the default policy a burst costs one refetch plus at most
        /// one follow-up, and the settled value is fresh.
        #[test]
        fn prop_burst_costs_at_most_one_follow_up(burst in 1usize..40) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let (fetches, fresh) = rt.block_on(async move {
                let cache = QueryCache::default();
                let k = CacheKey::single("admin-badge-donations");
                cache.set(
                    k.clone(),
                    Arc::new(super::super::FnFetcher::new(|| async {
                        tokio::task::yield_now().await;
                        Ok::<_, PalikaError>(QueryValue::Count(1))
                    })),
                );
                cache.get(&k);
                cache.settled(&k).await;

                for _ in 0..burst {
                    cache.invalidate(&k);
                }
                cache.settled(&k).await;
                let fresh = cache.get_count(&k).map(|r| r.is_fresh());
                (cache.fetch_count(&k), fresh)
            });
            let expected = if burst > 1 { 3 } else { 2 };
            prop_assert_eq!(fetches, expected);
            prop_assert_eq!(fresh, Some(true));
        }
    }
}
