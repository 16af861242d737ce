//! Query cache with notification-driven invalidation.
//!
//! This module keeps query results keyed by [`CacheKey`](palika_core::CacheKey)
//! and refreshes them when the realtime layer reports that the underlying
//! collection changed.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   invalidate(key)   ┌──────────────┐   fetch()   ┌───────────┐
//! │ Subscription │ ──────────────────→ │  QueryCache  │ ──────────→ │  Fetcher  │
//! │   Manager    │                     │ (per-key     │ ←────────── │ (count /  │
//! └──────────────┘                     │  entries)    │   value     │  query)   │
//!                                      └──────────────┘             └───────────┘
//!                                            ↑  get(key)
//!                                            │
//!                                        consumers
//! ```
//!
//! # Correctness
//!
//! - A value is never reported fresh between an invalidation of its key and
//!   the successful completion of the following fetch.
//! - At most one fetch per key is in flight.
//! - Fetch failures are recorded, never propagated; the last known value
//!   stays readable.

mod cached;
mod fetchers;
mod query_cache;
mod traits;

pub use cached::{CacheLookup, CachedResult, QueryValue};
pub use fetchers::{CountFetcher, RecordsFetcher};
pub use query_cache::QueryCache;
pub use traits::{CacheStats, FnFetcher, QueryFetcher};
