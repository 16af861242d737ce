//! Cached values and the staleness metadata served with them.
//!
//! The cache never hides staleness: every read comes back as a
//! [`CachedResult`] that says whether the value is still current.

use chrono::Utc;
use palika_core::{Record, Timestamp};
use std::time::Duration;

/// What a fetcher computes for one cache key.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    /// Result of a filtered count.
    Count(u64),
    /// Result of a list query.
    Records(Vec<Record>),
}

impl QueryValue {
    pub fn as_count(&self) -> Option<u64> {
        match self {
            Self::Count(n) => Some(*n),
            Self::Records(_) => None,
        }
    }

    pub fn as_records(&self) -> Option<&[Record]> {
        match self {
            Self::Records(records) => Some(records),
            Self::Count(_) => None,
        }
    }

    pub fn into_records(self) -> Option<Vec<Record>> {
        match self {
            Self::Records(records) => Some(records),
            Self::Count(_) => None,
        }
    }

    /// Short name of the variant, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Count(_) => "count",
            Self::Records(_) => "records",
        }
    }
}

/// A cached value plus its staleness flag.
///
/// `stale` is set the moment the key is invalidated and cleared only when a
/// refetch completes successfully. Consumers may keep showing a stale value
/// (with a loading hint) but must not treat it as current.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult<T> {
    value: T,
    stale: bool,
    fetched_at: Timestamp,
}

impl<T> CachedResult<T> {
    pub fn new(value: T, stale: bool, fetched_at: Timestamp) -> Self {
        Self {
            value,
            stale,
            fetched_at,
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    /// Get a reference to the underlying value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// True while an invalidation has not yet been answered by a successful
    /// refetch.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn is_fresh(&self) -> bool {
        !self.stale
    }

    /// When the value was fetched from the backend.
    pub fn fetched_at(&self) -> Timestamp {
        self.fetched_at
    }

    /// Time elapsed since the value was fetched.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CachedResult<U>
    where
        F: FnOnce(T) -> U,
    {
        CachedResult {
            value: f(self.value),
            stale: self.stale,
            fetched_at: self.fetched_at,
        }
    }
}

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    /// A value exists (possibly stale).
    Ready(CachedResult<T>),
    /// Nothing cached yet; a fetch may be in flight.
    Pending,
}

impl<T> CacheLookup<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn ready(self) -> Option<CachedResult<T>> {
        match self {
            Self::Ready(result) => Some(result),
            Self::Pending => None,
        }
    }
}
