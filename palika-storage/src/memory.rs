//! In-process stand-in for the hosted backend.
//!
//! `InMemoryFeed` stores records per collection and emits a [`ChangeEvent`]
//! on every open channel of a collection whenever that collection is mutated.
//! It backs the demo binary and the test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use palika_core::{
    CollectionName, EntityId, Filter, PalikaResult, QueryOptions, Record, StorageError,
};
use palika_events::{ChangeEvent, ChangeFeed, ChangeKind, ChangeStream, ChannelHandle};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

struct OpenChannel {
    collection: CollectionName,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct FeedState {
    collections: HashMap<CollectionName, Vec<Record>>,
    channels: HashMap<u64, OpenChannel>,
}

impl FeedState {
    /// Deliver `event` to every channel of its collection, dropping channels
    /// whose receiver is gone. Returns the number of deliveries.
    fn emit(&mut self, event: ChangeEvent) -> usize {
        let mut delivered = 0;
        self.channels.retain(|id, channel| {
            if channel.collection != event.collection {
                return true;
            }
            match channel.tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    trace!(channel_id = id, "dropping channel with no receiver");
                    false
                }
            }
        });
        delivered
    }
}

/// In-memory backend implementing [`ChangeFeed`].
#[derive(Default)]
pub struct InMemoryFeed {
    state: Mutex<FeedState>,
    next_channel_id: AtomicU64,
}

impl InMemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> PalikaResult<MutexGuard<'_, FeedState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    /// Insert a row and notify the collection's channels.
    pub fn insert(&self, collection: &CollectionName, fields: Value) -> PalikaResult<Record> {
        let record = Record::new(fields)?;
        let mut state = self.lock()?;
        state
            .collections
            .entry(collection.clone())
            .or_default()
            .push(record.clone());
        let delivered = state.emit(
            ChangeEvent::new(collection.clone(), ChangeKind::Insert).with_record(record.id),
        );
        debug!(collection = %collection, id = %record.id, delivered, "record inserted");
        Ok(record)
    }

    /// Insert several rows. Each row produces its own notification, the way
    /// a bulk insert does on the hosted backend.
    pub fn insert_many(
        &self,
        collection: &CollectionName,
        rows: impl IntoIterator<Item = Value>,
    ) -> PalikaResult<Vec<Record>> {
        rows.into_iter()
            .map(|fields| self.insert(collection, fields))
            .collect()
    }

    /// Merge `patch` into an existing row and notify.
    pub fn update(
        &self,
        collection: &CollectionName,
        id: EntityId,
        patch: Value,
    ) -> PalikaResult<Record> {
        let Value::Object(patch) = patch else {
            return Err(StorageError::InvalidRecord {
                got: "non-object patch".to_string(),
            }
            .into());
        };
        let mut state = self.lock()?;
        let record = state
            .collections
            .get_mut(collection)
            .and_then(|rows| rows.iter_mut().find(|r| r.id == id))
            .ok_or_else(|| StorageError::NotFound {
                collection: collection.clone(),
                id,
            })?;
        record.merge(patch);
        let updated = record.clone();
        let delivered =
            state.emit(ChangeEvent::new(collection.clone(), ChangeKind::Update).with_record(id));
        debug!(collection = %collection, id = %id, delivered, "record updated");
        Ok(updated)
    }

    /// Remove a row and notify.
    pub fn delete(&self, collection: &CollectionName, id: EntityId) -> PalikaResult<Record> {
        let mut state = self.lock()?;
        let rows = state.collections.get_mut(collection);
        let removed = rows
            .and_then(|rows| {
                let idx = rows.iter().position(|r| r.id == id)?;
                Some(rows.remove(idx))
            })
            .ok_or_else(|| StorageError::NotFound {
                collection: collection.clone(),
                id,
            })?;
        let delivered =
            state.emit(ChangeEvent::new(collection.clone(), ChangeKind::Delete).with_record(id));
        debug!(collection = %collection, id = %id, delivered, "record deleted");
        Ok(removed)
    }

    /// Emit an opaque notification without touching any row.
    pub fn notify(&self, collection: &CollectionName) -> PalikaResult<usize> {
        let mut state = self.lock()?;
        Ok(state.emit(ChangeEvent::opaque(collection.clone())))
    }

    /// Snapshot of every row in `collection`.
    pub fn records(&self, collection: &CollectionName) -> PalikaResult<Vec<Record>> {
        let state = self.lock()?;
        Ok(state.collections.get(collection).cloned().unwrap_or_default())
    }

    /// Number of channels currently open for `collection`.
    pub fn open_channel_count(&self, collection: &CollectionName) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .channels
            .values()
            .filter(|c| &c.collection == collection && !c.tx.is_closed())
            .count()
    }

    /// Drop every channel of `collection` from the server side, ending their
    /// streams. Returns how many were dropped.
    pub fn disconnect(&self, collection: &CollectionName) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = state.channels.len();
        state.channels.retain(|_, c| &c.collection != collection);
        let dropped = before - state.channels.len();
        debug!(collection = %collection, dropped, "channels disconnected");
        dropped
    }
}

#[async_trait]
impl ChangeFeed for InMemoryFeed {
    async fn query(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        options: &QueryOptions,
    ) -> PalikaResult<Vec<Record>> {
        let mut rows: Vec<Record> = {
            let state = self.lock()?;
            state
                .collections
                .get(collection)
                .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
                .unwrap_or_default()
        };
        options.apply(&mut rows);
        Ok(rows)
    }

    async fn count(&self, collection: &CollectionName, filter: &Filter) -> PalikaResult<u64> {
        let state = self.lock()?;
        let n = state
            .collections
            .get(collection)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).count())
            .unwrap_or(0);
        Ok(n as u64)
    }

    async fn open_channel(
        &self,
        collection: &CollectionName,
    ) -> PalikaResult<(ChannelHandle, ChangeStream)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut state = self.lock()?;
            state.channels.insert(
                id,
                OpenChannel {
                    collection: collection.clone(),
                    tx,
                },
            );
        }
        let handle = ChannelHandle {
            id,
            collection: collection.clone(),
        };
        debug!(channel = %handle, "channel opened");
        Ok((handle, UnboundedReceiverStream::new(rx).boxed()))
    }

    fn close_channel(&self, handle: &ChannelHandle) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.channels.remove(&handle.id).is_some() {
            debug!(channel = %handle, "channel closed");
        }
    }
}
