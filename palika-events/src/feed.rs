//! Change feed client trait.

use crate::ChangeEvent;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use palika_core::{CollectionName, Filter, PalikaResult, QueryOptions, Record};
use std::fmt;
use std::sync::Arc;

/// Stream of notifications for one open channel.
///
/// The stream ends when the channel is closed, by either side.
pub type ChangeStream = BoxStream<'static, ChangeEvent>;

/// Identifies one open channel so it can be closed later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    pub id: u64,
    pub collection: CollectionName,
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.collection, self.id)
    }
}

/// Client for the hosted backend.
///
/// Implementations must be safe to share across tasks. `close_channel` is
/// synchronous so that consumers can release channels from `Drop`.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Fetch records of `collection` matching `filter`, shaped by `options`.
    async fn query(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        options: &QueryOptions,
    ) -> PalikaResult<Vec<Record>>;

    /// Count records of `collection` matching `filter`.
    async fn count(&self, collection: &CollectionName, filter: &Filter) -> PalikaResult<u64>;

    /// Open a notification channel for `collection`.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::OpenFailed` (or a storage error) when the
    /// subscription cannot be established.
    async fn open_channel(
        &self,
        collection: &CollectionName,
    ) -> PalikaResult<(ChannelHandle, ChangeStream)>;

    /// Release a channel. Closing an unknown or already-closed handle is a
    /// no-op.
    fn close_channel(&self, handle: &ChannelHandle);
}

#[async_trait]
impl<F: ChangeFeed + ?Sized> ChangeFeed for Arc<F> {
    async fn query(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        options: &QueryOptions,
    ) -> PalikaResult<Vec<Record>> {
        (**self).query(collection, filter, options).await
    }

    async fn count(&self, collection: &CollectionName, filter: &Filter) -> PalikaResult<u64> {
        (**self).count(collection, filter).await
    }

    async fn open_channel(
        &self,
        collection: &CollectionName,
    ) -> PalikaResult<(ChannelHandle, ChangeStream)> {
        (**self).open_channel(collection).await
    }

    fn close_channel(&self, handle: &ChannelHandle) {
        (**self).close_channel(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChangeKind;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Feed that emits two notifications per channel and then ends.
    #[derive(Default)]
    struct TwoShotFeed {
        closed: AtomicU64,
    }

    #[async_trait]
    impl ChangeFeed for TwoShotFeed {
        async fn query(
            &self,
            _collection: &CollectionName,
            _filter: &Filter,
            _options: &QueryOptions,
        ) -> PalikaResult<Vec<Record>> {
            Ok(Vec::new())
        }

        async fn count(&self, _collection: &CollectionName, _filter: &Filter) -> PalikaResult<u64> {
            Ok(2)
        }

        async fn open_channel(
            &self,
            collection: &CollectionName,
        ) -> PalikaResult<(ChannelHandle, ChangeStream)> {
            let events = vec![
                ChangeEvent::new(collection.clone(), ChangeKind::Insert),
                ChangeEvent::new(collection.clone(), ChangeKind::Delete),
            ];
            let handle = ChannelHandle {
                id: 1,
                collection: collection.clone(),
            };
            Ok((handle, futures_util::stream::iter(events).boxed()))
        }

        fn close_channel(&self, _handle: &ChannelHandle) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_arc_feed_delegates() {
        let feed = Arc::new(TwoShotFeed::default());
        let collection = CollectionName::new("news").unwrap();

        assert_eq!(feed.count(&collection, &Filter::all()).await.unwrap(), 2);

        let (handle, stream) = feed.open_channel(&collection).await.unwrap();
        let kinds: Vec<_> = stream.map(|e| e.kind).collect().await;
        assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Delete]);

        feed.close_channel(&handle);
        assert_eq!(feed.closed.load(Ordering::SeqCst), 1);
        assert_eq!(handle.to_string(), "news#1");
    }
}
