//! palika Storage - Query Cache and In-Memory Backend
//!
//! Two pieces live here:
//!
//! - [`cache`]: the keyed query-result cache that the realtime layer
//!   invalidates, with coalescing refetch and stale-while-revalidate reads;
//! - [`InMemoryFeed`]: a local [`ChangeFeed`](palika_events::ChangeFeed)
//!   implementation standing in for the hosted backend.

pub mod cache;
mod memory;

pub use cache::{
    CacheLookup, CacheStats, CachedResult, CountFetcher, FnFetcher, QueryCache, QueryFetcher,
    QueryValue, RecordsFetcher,
};
pub use memory::InMemoryFeed;
