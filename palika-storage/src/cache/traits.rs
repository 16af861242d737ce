//! Fetcher trait and cache statistics.
//!
//! A fetcher knows how to compute the value behind one cache key. The cache
//! owns when to call it; the fetcher owns how.

use super::QueryValue;
use async_trait::async_trait;
use palika_core::PalikaResult;
use std::future::Future;

/// Computes the value for one cache key.
///
/// # Implementation Requirements
///
/// - `fetch()` may be called many times over the cache's lifetime, but never
///   concurrently for the same key
/// - Implementations must be `Send + Sync` so the cache can run them on
///   spawned tasks
/// - Errors are recorded by the cache, never propagated to readers
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    /// Run the underlying query.
    async fn fetch(&self) -> PalikaResult<QueryValue>;

    /// Human-readable description used in logs.
    fn describe(&self) -> String {
        "fetcher".to_string()
    }
}

/// Fetcher backed by an async closure.
///
/// Handy for ad-hoc queries and tests:
///
/// ```ignore
/// let fetcher = FnFetcher::new(|| async { Ok(QueryValue::Count(3)) });
/// ```
pub struct FnFetcher<F> {
    f: F,
}

impl<F> FnFetcher<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> QueryFetcher for FnFetcher<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = PalikaResult<QueryValue>> + Send,
{
    async fn fetch(&self) -> PalikaResult<QueryValue> {
        (self.f)().await
    }

    fn describe(&self) -> String {
        "closure".to_string()
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that found a value (fresh or stale).
    pub hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
    /// Fetches started, initial loads and refetches alike.
    pub fetches: u64,
    /// Invalidations absorbed by a refetch already in flight.
    pub coalesced: u64,
    /// Fetches that returned an error.
    pub failures: u64,
    /// Number of keys the cache knows about.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
