//! Subscription manager: one shared change channel per collection.
//!
//! Consumers register the cache keys they care about against a collection.
//! The manager keeps one open channel per collection no matter how many
//! consumers registered, reference-counts them, and on every notification
//! invalidates the union of registered keys once.
//!
//! ```text
//!  watch(issues, [admin-badge-issues]) ─┐
//!  watch(issues, [news-list])          ─┼─→ slot(issues) ─→ 1 channel ─→ listener
//!                                        │     refcount 2                   │
//!                                        │                                  ↓
//!                                        │                 invalidate {admin-badge-issues,
//!                                        │                             news-list}
//! ```
//!
//! A listener whose stream ends while subscribers remain reopens the channel
//! with backoff and invalidates every registered key, since changes may have
//! been missed in between. When a round of attempts fails it pauses for
//! `max_ms` and tries again, for as long as the collection has subscribers.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use palika_core::{
    CacheKey, ChannelError, CollectionName, PalikaResult, RealtimeConfig, ReconnectConfig,
    StorageError,
};
use palika_events::{ChangeFeed, ChangeStream, ChannelHandle};
use palika_storage::QueryCache;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Identifies one registration with the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Returned by [`SubscriptionManager::subscribe`], consumed by
/// [`SubscriptionManager::unsubscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub collection: CollectionName,
}

struct LiveChannel {
    /// `None` while the listener is reconnecting.
    handle: Option<ChannelHandle>,
    listener: JoinHandle<()>,
}

impl LiveChannel {
    fn is_open(&self) -> bool {
        self.handle.is_some()
    }
}

struct CollectionSlot {
    channel: LiveChannel,
    registrations: HashMap<SubscriptionId, BTreeSet<CacheKey>>,
    /// Which listener currently owns the slot.
    generation: u64,
    processed: u64,
}

impl CollectionSlot {
    fn keys(&self) -> BTreeSet<CacheKey> {
        self.registrations.values().flatten().cloned().collect()
    }
}

/// Outcome of one reconnect round.
enum Recovery {
    Reopened(u64, ChangeStream),
    /// Every attempt failed; try again after the pause.
    Retry(Duration),
    /// The slot was released or taken over.
    Released,
}

type Pool = HashMap<CollectionName, CollectionSlot>;

struct ManagerInner<F: ChangeFeed + 'static> {
    feed: F,
    cache: QueryCache,
    reconnect: ReconnectConfig,
    pool: Mutex<Pool>,
    /// Per-collection gates serializing channel opens.
    gates: Mutex<HashMap<CollectionName, Arc<tokio::sync::Mutex<()>>>>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
}

impl<F: ChangeFeed + 'static> ManagerInner<F> {
    fn pool(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_pool(&self) -> PalikaResult<MutexGuard<'_, Pool>> {
        self.pool
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn gate(&self, collection: &CollectionName) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(collection.clone()).or_default())
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register `keys` on a slot that already has a listener. Returns `None`
    /// when the collection has no slot yet.
    ///
    /// A slot whose listener is reconnecting accepts registrations; its keys
    /// are invalidated once the channel is back.
    fn register_live(
        &self,
        collection: &CollectionName,
        id: SubscriptionId,
        keys: &BTreeSet<CacheKey>,
    ) -> PalikaResult<Option<usize>> {
        let mut pool = self.try_pool()?;
        Ok(pool.get_mut(collection).map(|slot| {
            slot.registrations.insert(id, keys.clone());
            slot.registrations.len()
        }))
    }

    async fn open_with_retry(
        &self,
        collection: &CollectionName,
    ) -> PalikaResult<(ChannelHandle, ChangeStream)> {
        let max_attempts = self.reconnect.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            match self.feed.open_channel(collection).await {
                Ok(opened) => {
                    if attempt > 1 {
                        info!(collection = %collection, attempt, "channel opened after retry");
                    }
                    return Ok(opened);
                }
                Err(err) => {
                    warn!(
                        collection = %collection,
                        attempt,
                        max_attempts,
                        error = %err,
                        "channel open failed"
                    );
                    last_reason = err.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.reconnect.delay_for(attempt)).await;
                    }
                }
            }
        }

        Err(ChannelError::OpenFailed {
            collection: collection.clone(),
            attempts: max_attempts,
            reason: last_reason,
        }
        .into())
    }

    /// Invalidate every key registered for `collection`. Returns `false`
    /// when the listener at `generation` no longer owns the slot.
    fn dispatch(&self, collection: &CollectionName, generation: u64) -> bool {
        let keys = {
            let mut pool = self.pool();
            let Some(slot) = pool.get_mut(collection) else {
                return false;
            };
            if slot.generation != generation {
                return false;
            }
            slot.processed += 1;
            slot.keys()
        };

        // Pool lock released: invalidation may start fetches.
        let started = self.cache.invalidate_all(&keys);
        debug!(
            collection = %collection,
            keys = keys.len(),
            started,
            "notification dispatched"
        );
        true
    }

    /// Run one reconnect round for a lost channel.
    async fn recover(&self, collection: &CollectionName, generation: u64) -> Recovery {
        let old = {
            let mut pool = self.pool();
            let Some(slot) = pool.get_mut(collection) else {
                return Recovery::Released;
            };
            if slot.generation != generation {
                return Recovery::Released;
            }
            slot.channel.handle.take()
        };
        if let Some(old) = old {
            self.feed.close_channel(&old);
            warn!(collection = %collection, channel = %old, "change channel lost, reopening");
        }

        let gate = self.gate(collection);
        let _opening = gate.lock().await;
        let result = self.open_with_retry(collection).await;

        let mut pool = self.pool();
        let slot = match pool.get_mut(collection) {
            Some(slot) if slot.generation == generation => slot,
            _ => {
                if let Ok((handle, _)) = &result {
                    self.feed.close_channel(handle);
                }
                return Recovery::Released;
            }
        };

        match result {
            Ok((handle, stream)) => {
                let next = self.next_generation();
                slot.generation = next;
                slot.channel.handle = Some(handle);
                let keys = slot.keys();
                drop(pool);

                info!(collection = %collection, keys = keys.len(), "change channel reopened");
                self.cache.invalidate_all(&keys);
                Recovery::Reopened(next, stream)
            }
            Err(err) => {
                let pause = Duration::from_millis(self.reconnect.max_ms);
                error!(
                    collection = %collection,
                    subscribers = slot.registrations.len(),
                    error = %err,
                    pause_ms = self.reconnect.max_ms,
                    "change channel still down, retrying after pause"
                );
                Recovery::Retry(pause)
            }
        }
    }
}

impl<F: ChangeFeed + 'static> Drop for ManagerInner<F> {
    fn drop(&mut self) {
        let pool = self.pool.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (collection, slot) in pool.drain() {
            slot.channel.listener.abort();
            if let Some(handle) = slot.channel.handle {
                self.feed.close_channel(&handle);
                debug!(collection = %collection, "channel released on shutdown");
            }
        }
    }
}

/// Listener task for one collection's channel.
///
/// Holds only a weak reference so that dropping the manager ends it. The
/// manager is not kept alive across a pause between reconnect rounds.
async fn run_listener<F: ChangeFeed + 'static>(
    inner: Weak<ManagerInner<F>>,
    collection: CollectionName,
    mut generation: u64,
    mut stream: ChangeStream,
) {
    loop {
        while let Some(event) = stream.next().await {
            let Some(manager) = inner.upgrade() else {
                return;
            };
            trace!(collection = %collection, kind = %event.kind, "notification received");
            if !manager.dispatch(&collection, generation) {
                return;
            }
        }

        stream = loop {
            let Some(manager) = inner.upgrade() else {
                return;
            };
            let outcome = manager.recover(&collection, generation).await;
            drop(manager);
            match outcome {
                Recovery::Reopened(next_generation, next_stream) => {
                    generation = next_generation;
                    break next_stream;
                }
                Recovery::Retry(pause) => tokio::time::sleep(pause).await,
                Recovery::Released => return,
            }
        };
    }
}

// ============================================================================
// MANAGER
// ============================================================================

/// Ref-counted pool of change channels, keyed by collection.
///
/// Cloning is cheap; clones share the pool.
pub struct SubscriptionManager<F: ChangeFeed + 'static> {
    inner: Arc<ManagerInner<F>>,
}

impl<F: ChangeFeed + 'static> Clone for SubscriptionManager<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ChangeFeed + 'static> fmt::Debug for SubscriptionManager<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("active_channels", &self.active_channels())
            .field("cache", &self.inner.cache)
            .finish()
    }
}

impl<F: ChangeFeed + 'static> SubscriptionManager<F> {
    pub fn new(feed: F, cache: QueryCache, reconnect: ReconnectConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                feed,
                cache,
                reconnect,
                pool: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Build a manager and its cache from configuration.
    pub fn from_config(feed: F, config: &RealtimeConfig) -> Self {
        Self::new(feed, QueryCache::new(&config.cache), config.reconnect.clone())
    }

    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    pub fn feed(&self) -> &F {
        &self.inner.feed
    }

    /// Register `keys` against `collection`, opening its channel if this is
    /// the first subscriber.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::OpenFailed` when the channel could not be
    /// opened within the configured attempts. Nothing is registered then.
    pub async fn subscribe<I>(
        &self,
        collection: CollectionName,
        keys: I,
    ) -> PalikaResult<SubscriptionHandle>
    where
        I: IntoIterator<Item = CacheKey>,
    {
        let keys: BTreeSet<CacheKey> = keys.into_iter().collect();
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let handle = SubscriptionHandle {
            id,
            collection: collection.clone(),
        };

        if let Some(refcount) = self.inner.register_live(&collection, id, &keys)? {
            debug!(
                collection = %collection,
                subscription = %id,
                refcount,
                "subscribed to shared channel"
            );
            return Ok(handle);
        }

        let gate = self.inner.gate(&collection);
        let _opening = gate.lock().await;

        // Another subscriber may have opened it while we waited.
        if let Some(refcount) = self.inner.register_live(&collection, id, &keys)? {
            debug!(
                collection = %collection,
                subscription = %id,
                refcount,
                "subscribed to shared channel"
            );
            return Ok(handle);
        }

        let (channel, stream) = self.inner.open_with_retry(&collection).await?;

        let mut pool = self.inner.pool();
        let generation = self.inner.next_generation();
        let listener = tokio::spawn(run_listener(
            Arc::downgrade(&self.inner),
            collection.clone(),
            generation,
            stream,
        ));
        info!(
            collection = %collection,
            channel = %channel,
            subscription = %id,
            "change channel opened"
        );
        pool.insert(
            collection,
            CollectionSlot {
                channel: LiveChannel {
                    handle: Some(channel),
                    listener,
                },
                registrations: HashMap::from([(id, keys)]),
                generation,
                processed: 0,
            },
        );
        Ok(handle)
    }

    /// Drop a registration. At refcount zero the listener stops and the
    /// channel is closed before this returns.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::UnknownHandle` when the handle is not (or no
    /// longer) registered.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> PalikaResult<()> {
        let released = {
            let mut pool = self.inner.pool();
            let unknown = || ChannelError::UnknownHandle {
                handle_id: handle.id.0,
            };
            let slot = pool.get_mut(&handle.collection).ok_or_else(unknown)?;
            if slot.registrations.remove(&handle.id).is_none() {
                return Err(unknown().into());
            }
            if !slot.registrations.is_empty() {
                debug!(
                    collection = %handle.collection,
                    subscription = %handle.id,
                    refcount = slot.registrations.len(),
                    "unsubscribed"
                );
                return Ok(());
            }
            pool.remove(&handle.collection)
        };

        if let Some(slot) = released {
            slot.channel.listener.abort();
            match slot.channel.handle {
                Some(channel) => {
                    self.inner.feed.close_channel(&channel);
                    info!(
                        collection = %handle.collection,
                        channel = %channel,
                        "change channel closed"
                    );
                }
                None => {
                    info!(
                        collection = %handle.collection,
                        "reconnect abandoned, no subscribers left"
                    );
                }
            }
        }
        Ok(())
    }

    /// A closed lifecycle guard for `collection` and `keys`.
    pub fn subscription<I>(&self, collection: CollectionName, keys: I) -> RealtimeSubscription<F>
    where
        I: IntoIterator<Item = CacheKey>,
    {
        RealtimeSubscription {
            manager: self.clone(),
            collection,
            keys: keys.into_iter().collect(),
            handle: None,
        }
    }

    /// An opened lifecycle guard: registered until closed or dropped.
    pub async fn watch<I>(
        &self,
        collection: CollectionName,
        keys: I,
    ) -> PalikaResult<RealtimeSubscription<F>>
    where
        I: IntoIterator<Item = CacheKey>,
    {
        let mut subscription = self.subscription(collection, keys);
        subscription.open().await?;
        Ok(subscription)
    }

    /// Number of live registrations for `collection`.
    pub fn refcount(&self, collection: &CollectionName) -> usize {
        self.inner
            .pool()
            .get(collection)
            .map(|slot| slot.registrations.len())
            .unwrap_or(0)
    }

    /// Number of collections with an open channel.
    pub fn active_channels(&self) -> usize {
        self.inner
            .pool()
            .values()
            .filter(|slot| slot.channel.is_open())
            .count()
    }

    /// Whether `collection` currently has an open channel. `false` while
    /// its listener is reconnecting.
    pub fn is_live(&self, collection: &CollectionName) -> bool {
        self.inner
            .pool()
            .get(collection)
            .map(|slot| slot.channel.is_open())
            .unwrap_or(false)
    }

    /// Union of keys registered against `collection`.
    pub fn registered_keys(&self, collection: &CollectionName) -> BTreeSet<CacheKey> {
        self.inner
            .pool()
            .get(collection)
            .map(CollectionSlot::keys)
            .unwrap_or_default()
    }

    /// Notifications dispatched for `collection` since its slot was created.
    pub fn notifications_processed(&self, collection: &CollectionName) -> u64 {
        self.inner
            .pool()
            .get(collection)
            .map(|slot| slot.processed)
            .unwrap_or(0)
    }
}

// ============================================================================
// LIFECYCLE GUARD
// ============================================================================

/// Registration scoped to a consumer's active lifetime.
///
/// `open()` registers, `close()` releases, and dropping an open guard
/// releases too. Both are idempotent.
pub struct RealtimeSubscription<F: ChangeFeed + 'static> {
    manager: SubscriptionManager<F>,
    collection: CollectionName,
    keys: BTreeSet<CacheKey>,
    handle: Option<SubscriptionHandle>,
}

impl<F: ChangeFeed + 'static> fmt::Debug for RealtimeSubscription<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeSubscription")
            .field("collection", &self.collection)
            .field("keys", &self.keys)
            .field("handle", &self.handle)
            .finish()
    }
}

impl<F: ChangeFeed + 'static> RealtimeSubscription<F> {
    /// Register with the manager. No-op when already open.
    pub async fn open(&mut self) -> PalikaResult<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let handle = self
            .manager
            .subscribe(self.collection.clone(), self.keys.iter().cloned())
            .await?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Release the registration. No-op when already closed.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.manager.unsubscribe(&handle) {
                debug!(subscription = %handle.id, error = %err, "subscription already released");
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether notifications are currently flowing for this registration.
    /// An open guard reads `false` while its channel is reconnecting.
    pub fn is_live(&self) -> bool {
        self.is_open() && self.manager.is_live(&self.collection)
    }

    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }

    pub fn keys(&self) -> &BTreeSet<CacheKey> {
        &self.keys
    }

    pub fn handle(&self) -> Option<&SubscriptionHandle> {
        self.handle.as_ref()
    }
}

impl<F: ChangeFeed + 'static> Drop for RealtimeSubscription<F> {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// TESTS
// ============================================================================
