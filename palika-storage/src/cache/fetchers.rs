//! Built-in fetchers over a [`ChangeFeed`].

use super::{QueryFetcher, QueryValue};
use async_trait::async_trait;
use palika_core::{CollectionName, Filter, PalikaResult, QueryOptions};
use palika_events::ChangeFeed;

/// Filtered count over one collection.
pub struct CountFetcher<F> {
    feed: F,
    collection: CollectionName,
    filter: Filter,
}

impl<F: ChangeFeed> CountFetcher<F> {
    pub fn new(feed: F, collection: CollectionName, filter: Filter) -> Self {
        Self {
            feed,
            collection,
            filter,
        }
    }

    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }
}

#[async_trait]
impl<F: ChangeFeed> QueryFetcher for CountFetcher<F> {
    async fn fetch(&self) -> PalikaResult<QueryValue> {
        let n = self.feed.count(&self.collection, &self.filter).await?;
        Ok(QueryValue::Count(n))
    }

    fn describe(&self) -> String {
        format!("count({})", self.collection)
    }
}

/// Filtered list query over one collection.
pub struct RecordsFetcher<F> {
    feed: F,
    collection: CollectionName,
    filter: Filter,
    options: QueryOptions,
}

impl<F: ChangeFeed> RecordsFetcher<F> {
    pub fn new(feed: F, collection: CollectionName, filter: Filter) -> Self {
        Self {
            feed,
            collection,
            filter,
            options: QueryOptions::default(),
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }
}

#[async_trait]
impl<F: ChangeFeed> QueryFetcher for RecordsFetcher<F> {
    async fn fetch(&self) -> PalikaResult<QueryValue> {
        let records = self
            .feed
            .query(&self.collection, &self.filter, &self.options)
            .await?;
        Ok(QueryValue::Records(records))
    }

    fn describe(&self) -> String {
        format!("query({})", self.collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryFeed;
    use palika_core::{PortalCollection, SortDirection};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_count_fetcher_applies_filter() {
        let feed = Arc::new(InMemoryFeed::new());
        let issues = PortalCollection::CommunityIssues.name();
        feed.insert(&issues, json!({"status": "open"})).unwrap();
        feed.insert(&issues, json!({"status": "open"})).unwrap();
        feed.insert(&issues, json!({"status": "resolved"})).unwrap();

        let fetcher = CountFetcher::new(feed, issues, Filter::eq("status", json!("open")));
        assert_eq!(fetcher.fetch().await.unwrap(), QueryValue::Count(2));
        assert_eq!(fetcher.describe(), "count(community_issues)");
    }

    #[tokio::test]
    async fn test_records_fetcher_applies_options() {
        let feed = Arc::new(InMemoryFeed::new());
        let news = PortalCollection::News.name();
        for rank in [2, 9, 5] {
            feed.insert(&news, json!({"rank": rank})).unwrap();
        }

        let fetcher = RecordsFetcher::new(feed, news, Filter::all()).with_options(
            QueryOptions::new()
                .order_by("rank", SortDirection::Desc)
                .with_limit(2),
        );
        let value = fetcher.fetch().await.unwrap();
        let ranks: Vec<_> = value
            .as_records()
            .unwrap()
            .iter()
            .map(|r| r.field("rank").cloned().unwrap())
            .collect();
        assert_eq!(ranks, vec![json!(9), json!(5)]);
    }
}
