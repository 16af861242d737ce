//! palika Test Utilities
//!
//! Centralized test infrastructure for the palika workspace:
//! - [`ScriptedFeed`], a change feed with failure injection and call counters
//! - Proptest generators for the shared vocabulary
//! - Test fixtures for common scenarios
//! - Custom assertions for palika-specific validation

// Re-export the in-memory backend from its source crate
pub use palika_storage::InMemoryFeed;

// Re-export core types for convenience
pub use palika_core::{
    BadgeCounts, CacheKey, ChannelError, CoalescePolicy, CollectionName, FetchError, Filter,
    PalikaError, PalikaResult, PortalCollection, QueryOptions, RealtimeConfig, ReconnectConfig,
    Record, StorageError,
};

use async_trait::async_trait;
use palika_events::{ChangeFeed, ChangeStream, ChannelHandle};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// SCRIPTED FEED
// ============================================================================

/// Change feed wrapping an [`InMemoryFeed`] whose behaviour tests can script.
///
/// - channel opens can be made to fail a number of times, or always;
/// - counts for a collection can be made to fail, or held open until
///   released, so a test can land notifications while a refetch is in flight;
/// - every call is counted.
pub struct ScriptedFeed {
    backend: InMemoryFeed,
    failing_opens: AtomicU32,
    opens_down: AtomicBool,
    failing_counts: Mutex<HashSet<CollectionName>>,
    held_counts: watch::Sender<HashSet<CollectionName>>,
    count_calls: Mutex<HashMap<CollectionName, u64>>,
    query_calls: AtomicU64,
    open_calls: AtomicU64,
    close_calls: AtomicU64,
}

impl Default for ScriptedFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedFeed {
    pub fn new() -> Self {
        let (held_counts, _) = watch::channel(HashSet::new());
        Self {
            backend: InMemoryFeed::new(),
            failing_opens: AtomicU32::new(0),
            opens_down: AtomicBool::new(false),
            failing_counts: Mutex::new(HashSet::new()),
            held_counts,
            count_calls: Mutex::new(HashMap::new()),
            query_calls: AtomicU64::new(0),
            open_calls: AtomicU64::new(0),
            close_calls: AtomicU64::new(0),
        }
    }

    /// The wrapped backend, for mutations and channel inspection.
    pub fn backend(&self) -> &InMemoryFeed {
        &self.backend
    }

    /// Make the next `n` channel opens fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.failing_opens.store(n, Ordering::SeqCst);
    }

    /// Make every channel open fail until called again with `false`.
    pub fn set_opens_down(&self, down: bool) {
        self.opens_down.store(down, Ordering::SeqCst);
    }

    /// Make counts over `collection` fail (or succeed again).
    pub fn fail_counts(&self, collection: &CollectionName, fail: bool) {
        let mut failing = self
            .failing_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if fail {
            failing.insert(collection.clone());
        } else {
            failing.remove(collection);
        }
    }

    /// Block counts over `collection` until [`release_counts`](Self::release_counts).
    pub fn hold_counts(&self, collection: &CollectionName) {
        self.held_counts.send_modify(|held| {
            held.insert(collection.clone());
        });
    }

    pub fn release_counts(&self, collection: &CollectionName) {
        self.held_counts.send_modify(|held| {
            held.remove(collection);
        });
    }

    /// Number of counts issued against `collection`, held ones included.
    pub fn count_calls(&self, collection: &CollectionName) -> u64 {
        self.count_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .copied()
            .unwrap_or(0)
    }

    pub fn query_calls(&self) -> u64 {
        self.query_calls.load(Ordering::SeqCst)
    }

    /// Number of open attempts, failed ones included.
    pub fn open_calls(&self) -> u64 {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> u64 {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn take_open_failure(&self) -> bool {
        if self.opens_down.load(Ordering::SeqCst) {
            return true;
        }
        self.failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ChangeFeed for ScriptedFeed {
    async fn query(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        options: &QueryOptions,
    ) -> PalikaResult<Vec<Record>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.backend.query(collection, filter, options).await
    }

    async fn count(&self, collection: &CollectionName, filter: &Filter) -> PalikaResult<u64> {
        {
            let mut calls = self
                .count_calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *calls.entry(collection.clone()).or_insert(0) += 1;
        }

        let mut held = self.held_counts.subscribe();
        let _ = held.wait_for(|held| !held.contains(collection)).await;

        let failing = self
            .failing_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(collection);
        if failing {
            return Err(StorageError::CollectionUnavailable {
                collection: collection.clone(),
                reason: "scripted count failure".to_string(),
            }
            .into());
        }
        self.backend.count(collection, filter).await
    }

    async fn open_channel(
        &self,
        collection: &CollectionName,
    ) -> PalikaResult<(ChannelHandle, ChangeStream)> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_open_failure() {
            return Err(StorageError::CollectionUnavailable {
                collection: collection.clone(),
                reason: "scripted open failure".to_string(),
            }
            .into());
        }
        self.backend.open_channel(collection).await
    }

    fn close_channel(&self, handle: &ChannelHandle) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.backend.close_channel(handle);
    }
}

// ============================================================================
// ASYNC HELPERS
// ============================================================================

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// elapses. Returns whether it held.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating palika types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    /// Generate a valid collection name.
    pub fn arb_collection_name() -> impl Strategy<Value = CollectionName> {
        "[a-z][a-z0-9_]{0,20}".prop_filter_map("valid collection name", |s| {
            CollectionName::new(s).ok()
        })
    }

    /// Generate one of the portal's collections.
    pub fn arb_portal_collection() -> impl Strategy<Value = PortalCollection> {
        prop::sample::select(PortalCollection::ALL.to_vec())
    }

    /// Generate a cache key of one to three parts.
    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        prop::collection::vec("[a-z][a-z0-9-]{0,12}", 1..4).prop_map(CacheKey::new)
    }

    /// Generate a workflow status string.
    pub fn arb_status() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec!["open", "pending", "resolved", "verified", "rejected"])
    }

    /// Generate the fields of a workflow record.
    pub fn arb_record_fields() -> impl Strategy<Value = Value> {
        (arb_status(), 1u32..=9).prop_map(|(status, ward)| json!({"status": status, "ward": ward}))
    }

    pub fn arb_coalesce_policy() -> impl Strategy<Value = CoalescePolicy> {
        prop_oneof![Just(CoalescePolicy::Absorb), Just(CoalescePolicy::Trailing)]
    }

    /// Generate a reconnect policy that passes validation.
    pub fn arb_reconnect_config() -> impl Strategy<Value = ReconnectConfig> {
        (1u64..1_000, 0u64..10_000, 1.0f64..4.0, 0u64..100, 1u32..10).prop_map(
            |(initial_ms, extra_ms, multiplier, jitter_ms, max_attempts)| ReconnectConfig {
                initial_ms,
                max_ms: initial_ms + extra_ms,
                multiplier,
                jitter_ms,
                max_attempts,
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;
    use serde_json::{json, Value};

    /// Reconnect policy with millisecond delays and no jitter.
    pub fn fast_reconnect() -> ReconnectConfig {
        ReconnectConfig {
            initial_ms: 1,
            max_ms: 5,
            multiplier: 2.0,
            jitter_ms: 0,
            max_attempts: 3,
        }
    }

    /// Default configuration with [`fast_reconnect`].
    pub fn realtime_config() -> RealtimeConfig {
        RealtimeConfig {
            reconnect: fast_reconnect(),
            ..RealtimeConfig::default()
        }
    }

    pub fn issues() -> CollectionName {
        PortalCollection::CommunityIssues.name()
    }

    pub fn donations() -> CollectionName {
        PortalCollection::Donations.name()
    }

    pub fn support_requests() -> CollectionName {
        PortalCollection::SupportRequests.name()
    }

    pub fn news() -> CollectionName {
        PortalCollection::News.name()
    }

    pub fn open_issue(title: &str) -> Value {
        json!({"title": title, "status": "open", "ward": 3})
    }

    pub fn resolved_issue(title: &str) -> Value {
        json!({"title": title, "status": "resolved", "ward": 3})
    }

    pub fn pending_donation(amount: u64) -> Value {
        json!({"donor": "anonymous", "amount": amount, "status": "pending"})
    }

    pub fn verified_donation(amount: u64) -> Value {
        json!({"donor": "anonymous", "amount": amount, "status": "verified"})
    }

    pub fn pending_support_request(subject: &str) -> Value {
        json!({"subject": subject, "status": "pending"})
    }

    pub fn news_item(title: &str) -> Value {
        json!({"title": title, "published_at": "2026-10-01T09:00:00Z"})
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for palika-specific validation.

    use super::*;

    /// Assert that a PalikaResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &PalikaResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a PalikaResult is Err.
    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &PalikaResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    /// Assert that a PalikaResult is an OpenFailed channel error for
    /// `collection`.
    #[track_caller]
    pub fn assert_open_failed<T: std::fmt::Debug>(
        result: &PalikaResult<T>,
        collection: &CollectionName,
    ) {
        match result {
            Err(PalikaError::Channel(ChannelError::OpenFailed { collection: c, .. })) => {
                assert_eq!(c, collection, "Wrong collection in OpenFailed error");
            }
            other => panic!("Expected OpenFailed for {}, got: {:?}", collection, other),
        }
    }

    /// Assert that a PalikaResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &PalikaResult<T>) {
        match result {
            Err(PalikaError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert badge counts field by field.
    #[track_caller]
    pub fn assert_badges(counts: BadgeCounts, issues: u64, donations: u64, support: u64) {
        assert_eq!(
            counts,
            BadgeCounts {
                issues,
                donations,
                support
            },
            "badge counts mismatch"
        );
    }
}
