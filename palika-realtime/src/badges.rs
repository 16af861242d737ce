//! Admin badge counters.
//!
//! The operator view shows three outstanding-work counters. Each one is a
//! filtered count over its own collection, cached under its own key and
//! refreshed by its own subscription:
//!
//! | Domain    | Collection         | Cache key                 | Filter             |
//! |-----------|--------------------|---------------------------|--------------------|
//! | Issues    | `community_issues` | `["admin-badge-issues"]`    | `status = open`    |
//! | Donations | `donations`        | `["admin-badge-donations"]` | `status = pending` |
//! | Support   | `support_requests` | `["admin-badge-support"]`   | `status = pending` |
//!
//! A counter that has not loaded yet reads as `0`. This briefly undercounts
//! at first load, in exchange for counts that are always plain integers.

use std::fmt;
use std::sync::Arc;

use palika_core::{BadgeCounts, CacheKey, CollectionName, Filter, PalikaResult, PortalCollection};
use palika_events::ChangeFeed;
use palika_storage::{CacheLookup, CountFetcher};
use serde_json::json;
use tracing::{info, warn};

use crate::subscription::{RealtimeSubscription, SubscriptionManager};

/// One badge counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BadgeDomain {
    Issues,
    Donations,
    Support,
}

impl BadgeDomain {
    pub const ALL: [BadgeDomain; 3] = [Self::Issues, Self::Donations, Self::Support];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issues => "issues",
            Self::Donations => "donations",
            Self::Support => "support",
        }
    }

    pub fn collection(&self) -> CollectionName {
        match self {
            Self::Issues => PortalCollection::CommunityIssues.name(),
            Self::Donations => PortalCollection::Donations.name(),
            Self::Support => PortalCollection::SupportRequests.name(),
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        match self {
            Self::Issues => CacheKey::single("admin-badge-issues"),
            Self::Donations => CacheKey::single("admin-badge-donations"),
            Self::Support => CacheKey::single("admin-badge-support"),
        }
    }

    /// Which rows count as outstanding work.
    pub fn filter(&self) -> Filter {
        match self {
            Self::Issues => Filter::eq("status", json!("open")),
            Self::Donations | Self::Support => Filter::eq("status", json!("pending")),
        }
    }
}

impl fmt::Display for BadgeDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Load state of one counter.
///
/// `Uninitialized → Loaded → Refreshing → Loaded`. There is no terminal
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    /// No count has arrived yet; the counter reads as zero.
    Uninitialized,
    /// The count is current.
    Loaded,
    /// A change arrived; the previous count is shown until the refetch lands.
    Refreshing,
}

/// Badge aggregator for the operator view.
///
/// Inactive when built. [`activate`](Self::activate) registers the count
/// fetchers and opens the three subscriptions; [`deactivate`](Self::deactivate)
/// or dropping releases them.
pub struct AdminBadges<F: ChangeFeed + Clone + 'static> {
    manager: SubscriptionManager<F>,
    subscriptions: Vec<(BadgeDomain, RealtimeSubscription<F>)>,
}

impl<F: ChangeFeed + Clone + 'static> fmt::Debug for AdminBadges<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminBadges")
            .field("active", &self.active_domains())
            .finish_non_exhaustive()
    }
}

impl<F: ChangeFeed + Clone + 'static> AdminBadges<F> {
    pub fn new(manager: SubscriptionManager<F>) -> Self {
        let subscriptions = BadgeDomain::ALL
            .iter()
            .map(|domain| {
                let subscription = manager.subscription(domain.collection(), [domain.cache_key()]);
                (*domain, subscription)
            })
            .collect();
        Self {
            manager,
            subscriptions,
        }
    }

    /// Build and activate in one step.
    pub async fn activated(manager: SubscriptionManager<F>) -> PalikaResult<Self> {
        let mut badges = Self::new(manager);
        badges.activate().await?;
        Ok(badges)
    }

    /// Register fetchers, open subscriptions and start the initial loads.
    ///
    /// Domains are independent: a domain whose channel cannot be opened is
    /// skipped and the others stay active. The first such error is returned.
    /// Calling again retries only the domains that are not open yet.
    pub async fn activate(&mut self) -> PalikaResult<()> {
        let cache = self.manager.cache().clone();
        let feed = self.manager.feed().clone();
        let mut first_error = None;

        for (domain, subscription) in &mut self.subscriptions {
            if subscription.is_open() {
                continue;
            }
            let key = domain.cache_key();
            cache.set(
                key.clone(),
                Arc::new(CountFetcher::new(
                    feed.clone(),
                    domain.collection(),
                    domain.filter(),
                )),
            );

            match subscription.open().await {
                Ok(()) => {
                    cache.get(&key);
                }
                Err(err) => {
                    warn!(domain = %domain, error = %err, "badge subscription failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        info!(active = self.active_domains().len(), "admin badges activated");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Release every subscription. Cached counts stay readable.
    pub fn deactivate(&mut self) {
        for (_, subscription) in &mut self.subscriptions {
            subscription.close();
        }
        info!("admin badges deactivated");
    }

    pub fn is_active(&self) -> bool {
        self.subscriptions.iter().any(|(_, s)| s.is_open())
    }

    pub fn active_domains(&self) -> Vec<BadgeDomain> {
        self.subscriptions
            .iter()
            .filter(|(_, s)| s.is_open())
            .map(|(domain, _)| *domain)
            .collect()
    }

    /// Latest count for one domain, `0` until the first count arrives.
    pub fn count(&self, domain: BadgeDomain) -> u64 {
        self.manager
            .cache()
            .get_count(&domain.cache_key())
            .map(|result| result.into_value())
            .unwrap_or(0)
    }

    /// Latest counts. Each field is current as of its own last refetch.
    pub fn counts(&self) -> BadgeCounts {
        BadgeCounts {
            issues: self.count(BadgeDomain::Issues),
            donations: self.count(BadgeDomain::Donations),
            support: self.count(BadgeDomain::Support),
        }
    }

    pub fn state(&self, domain: BadgeDomain) -> CounterState {
        match self.manager.cache().get(&domain.cache_key()) {
            CacheLookup::Pending => CounterState::Uninitialized,
            CacheLookup::Ready(result) if result.is_stale() => CounterState::Refreshing,
            CacheLookup::Ready(_) => CounterState::Loaded,
        }
    }

    /// Resolve once no badge count is being fetched.
    pub async fn settled(&self) {
        for domain in BadgeDomain::ALL {
            self.manager.cache().settled(&domain.cache_key()).await;
        }
    }

    pub fn manager(&self) -> &SubscriptionManager<F> {
        &self.manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palika_storage::QueryCache;
    use palika_test_utils::{assertions::assert_badges, fixtures, ScriptedFeed};
    use std::time::Duration;

    fn badges() -> (Arc<ScriptedFeed>, AdminBadges<Arc<ScriptedFeed>>) {
        let feed = Arc::new(ScriptedFeed::new());
        let manager = SubscriptionManager::new(
            Arc::clone(&feed),
            QueryCache::default(),
            fixtures::fast_reconnect(),
        );
        (feed, AdminBadges::new(manager))
    }

    #[test]
    fn test_domain_table() {
        assert_eq!(BadgeDomain::Issues.collection().as_str(), "community_issues");
        assert_eq!(BadgeDomain::Donations.collection().as_str(), "donations");
        assert_eq!(BadgeDomain::Support.collection().as_str(), "support_requests");
        assert_eq!(BadgeDomain::Issues.cache_key().to_string(), "[admin-badge-issues]");
        assert_eq!(
            BadgeDomain::Donations.cache_key(),
            CacheKey::single("admin-badge-donations")
        );
        assert_eq!(BadgeDomain::Support.to_string(), "support");
    }

    #[tokio::test]
    async fn test_counts_zero_before_first_load() {
        let (feed, mut badges) = badges();
        feed.backend()
            .insert(&fixtures::issues(), fixtures::open_issue("Broken tap"))
            .unwrap();
        feed.hold_counts(&fixtures::issues());

        badges.activate().await.unwrap();
        assert_badges(badges.counts(), 0, 0, 0);
        assert_eq!(badges.state(BadgeDomain::Issues), CounterState::Uninitialized);

        feed.release_counts(&fixtures::issues());
        badges.settled().await;
        assert_badges(badges.counts(), 1, 0, 0);
        assert_eq!(badges.state(BadgeDomain::Issues), CounterState::Loaded);
    }

    #[tokio::test]
    async fn test_activate_opens_three_channels_once() {
        let (feed, mut badges) = badges();
        badges.activate().await.unwrap();
        badges.activate().await.unwrap();

        assert!(badges.is_active());
        assert_eq!(badges.active_domains().len(), 3);
        assert_eq!(badges.manager().active_channels(), 3);
        assert_eq!(feed.open_calls(), 3);

        badges.deactivate();
        assert!(!badges.is_active());
        assert_eq!(badges.manager().active_channels(), 0);
    }

    #[tokio::test]
    async fn test_refreshing_state_while_refetch_held() {
        let (feed, mut badges) = badges();
        badges.activate().await.unwrap();
        badges.settled().await;

        feed.hold_counts(&fixtures::donations());
        feed.backend()
            .insert(&fixtures::donations(), fixtures::pending_donation(250))
            .unwrap();
        let manager = badges.manager().clone();
        assert!(
            palika_test_utils::eventually(Duration::from_secs(2), || {
                manager.notifications_processed(&fixtures::donations()) == 1
            })
            .await
        );
        assert_eq!(badges.state(BadgeDomain::Donations), CounterState::Refreshing);
        assert_eq!(badges.count(BadgeDomain::Donations), 0);

        feed.release_counts(&fixtures::donations());
        badges.settled().await;
        assert_eq!(badges.state(BadgeDomain::Donations), CounterState::Loaded);
        assert_eq!(badges.count(BadgeDomain::Donations), 1);
    }

    #[tokio::test]
    async fn test_partial_activation_keeps_other_domains() {
        let (feed, mut badges) = badges();
        feed.set_opens_down(true);
        assert!(badges.activate().await.is_err());
        assert!(!badges.is_active());

        feed.set_opens_down(false);
        badges.activate().await.unwrap();
        assert_eq!(badges.active_domains(), BadgeDomain::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_drop_releases_subscriptions() {
        let (feed, badges) = badges();
        let manager = {
            let mut badges = badges;
            badges.activate().await.unwrap();
            badges.manager().clone()
        };
        assert_eq!(manager.active_channels(), 0);
        assert_eq!(feed.close_calls(), 3);
    }
}
