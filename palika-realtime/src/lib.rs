//! palika Realtime - Change-Notification Bridge
//!
//! Keeps client-side query results consistent with backend mutations in near
//! real time:
//!
//! ```text
//! backend mutation → feed notification → SubscriptionManager
//!                                              │ invalidate registered keys
//!                                              ↓
//!                                         QueryCache → refetch → consumers
//! ```
//!
//! - [`SubscriptionManager`]: one shared, ref-counted channel per collection;
//!   notifications invalidate every key registered against it.
//! - [`RealtimeSubscription`]: a consumer's registration, released on
//!   `close()` or drop.
//! - [`AdminBadges`]: the three outstanding-work counters of the operator
//!   view, derived from the same mechanism.

pub mod badges;
pub mod subscription;
pub mod telemetry;

pub use badges::{AdminBadges, BadgeDomain, CounterState};
pub use subscription::{
    RealtimeSubscription, SubscriptionHandle, SubscriptionId, SubscriptionManager,
};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, TelemetryError};

// Re-export the types consumers need alongside the manager
pub use palika_core::{BadgeCounts, CacheKey, CollectionName, RealtimeConfig};
pub use palika_storage::QueryCache;
