//! End-to-end scenarios: backend mutation → notification → invalidation →
//! refetch → consumer read.

use std::sync::Arc;
use std::time::Duration;

use palika_core::{CacheKey, CoalescePolicy, Filter, PalikaError};
use palika_realtime::{AdminBadges, BadgeDomain, CounterState, QueryCache, SubscriptionManager};
use palika_storage::CountFetcher;
use palika_test_utils::assertions::{assert_badges, assert_open_failed};
use palika_test_utils::{eventually, fixtures, ScriptedFeed};

type Manager = SubscriptionManager<Arc<ScriptedFeed>>;

const WAIT: Duration = Duration::from_secs(2);

fn setup(policy: CoalescePolicy) -> (Arc<ScriptedFeed>, Manager) {
    let feed = Arc::new(ScriptedFeed::new());
    let manager = SubscriptionManager::new(
        Arc::clone(&feed),
        QueryCache::with_policy(policy),
        fixtures::fast_reconnect(),
    );
    (feed, manager)
}

fn seed(feed: &ScriptedFeed) {
    let backend = feed.backend();
    backend
        .insert(&fixtures::issues(), fixtures::open_issue("Broken handpump"))
        .unwrap();
    backend
        .insert(&fixtures::issues(), fixtures::resolved_issue("Graffiti"))
        .unwrap();
    backend
        .insert(&fixtures::donations(), fixtures::pending_donation(1500))
        .unwrap();
    backend
        .insert(&fixtures::donations(), fixtures::verified_donation(800))
        .unwrap();
    backend
        .insert(
            &fixtures::support_requests(),
            fixtures::pending_support_request("Citizenship certificate"),
        )
        .unwrap();
}

async fn processed(manager: &Manager, collection: &palika_core::CollectionName, n: u64) -> bool {
    eventually(WAIT, || manager.notifications_processed(collection) >= n).await
}

#[tokio::test]
async fn burst_of_notifications_costs_one_refetch() {
    let (feed, manager) = setup(CoalescePolicy::Absorb);
    seed(&feed);
    let badges = AdminBadges::activated(manager.clone()).await.unwrap();
    badges.settled().await;
    assert_eq!(feed.count_calls(&fixtures::issues()), 1);

    feed.hold_counts(&fixtures::issues());
    for n in 0..5 {
        feed.backend()
            .insert(&fixtures::issues(), fixtures::open_issue(&format!("Leak {}", n)))
            .unwrap();
    }
    assert!(processed(&manager, &fixtures::issues(), 5).await);
    assert!(eventually(WAIT, || feed.count_calls(&fixtures::issues()) == 2).await);
    assert_eq!(badges.state(BadgeDomain::Issues), CounterState::Refreshing);

    feed.release_counts(&fixtures::issues());
    manager
        .cache()
        .settled(&BadgeDomain::Issues.cache_key())
        .await;
    assert_eq!(feed.count_calls(&fixtures::issues()), 2);

    // Part of the burst landed mid-fetch: the next read is served stale
    // and refreshes it.
    assert_eq!(badges.state(BadgeDomain::Issues), CounterState::Refreshing);
    badges.settled().await;
    assert_eq!(feed.count_calls(&fixtures::issues()), 3);
    assert_eq!(badges.count(BadgeDomain::Issues), 6);
    assert_eq!(badges.state(BadgeDomain::Issues), CounterState::Loaded);
}

#[tokio::test]
async fn default_policy_keeps_change_landing_after_fetch_started() {
    let (feed, manager) = setup(CoalescePolicy::default());
    seed(&feed);
    let badges = AdminBadges::activated(manager.clone()).await.unwrap();
    badges.settled().await;

    feed.hold_counts(&fixtures::support_requests());
    feed.backend()
        .insert(
            &fixtures::support_requests(),
            fixtures::pending_support_request("Water connection"),
        )
        .unwrap();
    assert!(processed(&manager, &fixtures::support_requests(), 1).await);
    assert!(eventually(WAIT, || feed.count_calls(&fixtures::support_requests()) == 2).await);

    feed.backend()
        .insert(
            &fixtures::support_requests(),
            fixtures::pending_support_request("Ward recommendation letter"),
        )
        .unwrap();
    assert!(processed(&manager, &fixtures::support_requests(), 2).await);
    feed.release_counts(&fixtures::support_requests());
    badges.settled().await;

    assert_eq!(feed.count_calls(&fixtures::support_requests()), 3);
    assert_eq!(badges.count(BadgeDomain::Support), 3);
    assert_eq!(badges.state(BadgeDomain::Support), CounterState::Loaded);
}

#[tokio::test]
async fn trailing_policy_adds_exactly_one_follow_up() {
    let (feed, manager) = setup(CoalescePolicy::Trailing);
    seed(&feed);
    let badges = AdminBadges::activated(manager.clone()).await.unwrap();
    badges.settled().await;

    feed.hold_counts(&fixtures::donations());
    for amount in [100, 200, 300, 400] {
        feed.backend()
            .insert(&fixtures::donations(), fixtures::pending_donation(amount))
            .unwrap();
    }
    assert!(processed(&manager, &fixtures::donations(), 4).await);
    feed.release_counts(&fixtures::donations());
    badges.settled().await;

    assert_eq!(feed.count_calls(&fixtures::donations()), 3);
    assert_eq!(badges.count(BadgeDomain::Donations), 5);
}

#[tokio::test]
async fn refcount_survives_subscribe_twice_unsubscribe_once() {
    let (feed, manager) = setup(CoalescePolicy::default());
    let issues = fixtures::issues();

    let first = manager
        .subscribe(issues.clone(), [CacheKey::single("admin-badge-issues")])
        .await
        .unwrap();
    let after_first = manager.refcount(&issues);
    let second = manager
        .subscribe(issues.clone(), [CacheKey::single("admin-badge-issues")])
        .await
        .unwrap();
    manager.unsubscribe(&second).unwrap();

    assert_eq!(manager.refcount(&issues), after_first);
    assert_eq!(feed.open_calls(), 1);

    let mut guard = manager.subscription(issues.clone(), [CacheKey::single("news-list")]);
    guard.open().await.unwrap();
    let opened = manager.refcount(&issues);
    guard.open().await.unwrap();
    assert_eq!(manager.refcount(&issues), opened);

    guard.close();
    manager.unsubscribe(&first).unwrap();
    assert_eq!(manager.refcount(&issues), 0);
    assert_eq!(manager.active_channels(), 0);
}

#[tokio::test]
async fn released_collection_triggers_no_invalidation() {
    let (feed, manager) = setup(CoalescePolicy::default());
    seed(&feed);
    let mut badges = AdminBadges::activated(manager.clone()).await.unwrap();
    badges.settled().await;
    badges.deactivate();

    for collection in [
        fixtures::issues(),
        fixtures::donations(),
        fixtures::support_requests(),
    ] {
        feed.backend().notify(&collection).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    for domain in BadgeDomain::ALL {
        assert_eq!(manager.cache().fetch_count(&domain.cache_key()), 1);
        assert_eq!(badges.state(domain), CounterState::Loaded);
    }
}

#[tokio::test]
async fn badges_read_zero_until_counts_arrive() {
    let (feed, manager) = setup(CoalescePolicy::default());
    seed(&feed);
    for collection in [
        fixtures::issues(),
        fixtures::donations(),
        fixtures::support_requests(),
    ] {
        feed.hold_counts(&collection);
    }

    let badges = AdminBadges::activated(manager.clone()).await.unwrap();
    assert_badges(badges.counts(), 0, 0, 0);
    for domain in BadgeDomain::ALL {
        assert_eq!(badges.state(domain), CounterState::Uninitialized);
    }

    for collection in [
        fixtures::issues(),
        fixtures::donations(),
        fixtures::support_requests(),
    ] {
        feed.release_counts(&collection);
    }
    badges.settled().await;
    assert_badges(badges.counts(), 1, 1, 1);
    assert_eq!(badges.counts().total(), 3);
}

#[tokio::test]
async fn failing_donations_refetch_leaves_other_badges_alone() {
    let (feed, manager) = setup(CoalescePolicy::default());
    seed(&feed);
    let badges = AdminBadges::activated(manager.clone()).await.unwrap();
    badges.settled().await;
    assert_badges(badges.counts(), 1, 1, 1);

    feed.fail_counts(&fixtures::donations(), true);
    let backend = feed.backend();
    backend
        .insert(&fixtures::issues(), fixtures::open_issue("Landslide"))
        .unwrap();
    backend
        .insert(&fixtures::donations(), fixtures::pending_donation(50))
        .unwrap();
    backend
        .insert(
            &fixtures::support_requests(),
            fixtures::pending_support_request("Tax receipt"),
        )
        .unwrap();

    assert!(processed(&manager, &fixtures::issues(), 1).await);
    assert!(processed(&manager, &fixtures::donations(), 1).await);
    assert!(processed(&manager, &fixtures::support_requests(), 1).await);
    badges.settled().await;

    // Donations keeps its last known value, marked stale.
    assert_badges(badges.counts(), 2, 1, 2);
    assert_eq!(badges.state(BadgeDomain::Issues), CounterState::Loaded);
    assert_eq!(badges.state(BadgeDomain::Donations), CounterState::Refreshing);
    assert_eq!(badges.state(BadgeDomain::Support), CounterState::Loaded);
    assert!(manager
        .cache()
        .last_error(&BadgeDomain::Donations.cache_key())
        .is_some());

    // Recovery on the next change.
    feed.fail_counts(&fixtures::donations(), false);
    backend.notify(&fixtures::donations()).unwrap();
    assert!(processed(&manager, &fixtures::donations(), 2).await);
    badges.settled().await;
    assert_badges(badges.counts(), 2, 2, 2);
}

#[tokio::test]
async fn one_notification_invalidates_every_consumer_once() {
    let (feed, manager) = setup(CoalescePolicy::default());
    seed(&feed);
    let issues = fixtures::issues();
    let badge_key = CacheKey::single("admin-badge-issues");
    let list_key = CacheKey::single("news-list");
    for key in [&badge_key, &list_key] {
        manager.cache().set(
            key.clone(),
            Arc::new(CountFetcher::new(
                Arc::clone(&feed),
                issues.clone(),
                Filter::all(),
            )),
        );
        manager.cache().get(key);
    }
    manager.cache().settle_all().await;

    let _badge = manager.watch(issues.clone(), [badge_key.clone()]).await.unwrap();
    let _list = manager.watch(issues.clone(), [list_key.clone()]).await.unwrap();
    assert_eq!(manager.registered_keys(&issues).len(), 2);

    feed.backend().notify(&issues).unwrap();
    assert!(processed(&manager, &issues, 1).await);
    manager.cache().settle_all().await;

    assert_eq!(manager.cache().fetch_count(&badge_key), 2);
    assert_eq!(manager.cache().fetch_count(&list_key), 2);
    assert_eq!(feed.count_calls(&issues), 4);
}

#[tokio::test]
async fn refetch_finishing_after_deactivate_is_served_to_next_consumer() {
    let (feed, manager) = setup(CoalescePolicy::default());
    seed(&feed);
    let mut badges = AdminBadges::activated(manager.clone()).await.unwrap();
    badges.settled().await;

    feed.hold_counts(&fixtures::donations());
    feed.backend()
        .insert(&fixtures::donations(), fixtures::pending_donation(75))
        .unwrap();
    assert!(processed(&manager, &fixtures::donations(), 1).await);
    badges.deactivate();
    drop(badges);

    feed.release_counts(&fixtures::donations());
    manager
        .cache()
        .settled(&BadgeDomain::Donations.cache_key())
        .await;

    let next = AdminBadges::activated(manager.clone()).await.unwrap();
    assert_eq!(next.count(BadgeDomain::Donations), 2);
    assert_eq!(next.state(BadgeDomain::Donations), CounterState::Loaded);
    assert_eq!(feed.count_calls(&fixtures::donations()), 2);
}

#[tokio::test]
async fn flaky_open_is_retried_transparently() {
    let (feed, manager) = setup(CoalescePolicy::default());
    feed.fail_next_opens(2);

    let guard = manager
        .watch(fixtures::news(), [CacheKey::single("news-list")])
        .await
        .unwrap();
    assert!(guard.is_open());
    assert_eq!(feed.open_calls(), 3);
    assert_eq!(manager.refcount(&fixtures::news()), 1);
}

#[tokio::test]
async fn channel_that_never_opens_surfaces_open_failed() {
    let (feed, manager) = setup(CoalescePolicy::default());
    feed.set_opens_down(true);

    let result = manager
        .subscribe(fixtures::donations(), [CacheKey::single("admin-badge-donations")])
        .await;
    assert_open_failed(&result, &fixtures::donations());
    assert_eq!(manager.refcount(&fixtures::donations()), 0);
    assert_eq!(manager.active_channels(), 0);

    let err = result.unwrap_err();
    assert!(matches!(err, PalikaError::Channel(_)));
    assert!(err.to_string().contains("donations"));
}

#[tokio::test]
async fn lost_channel_recovers_and_refreshes_badges() {
    let (feed, manager) = setup(CoalescePolicy::default());
    seed(&feed);
    let badges = AdminBadges::activated(manager.clone()).await.unwrap();
    badges.settled().await;

    // A change lands while the channel is down.
    feed.backend().disconnect(&fixtures::support_requests());
    feed.backend()
        .insert(
            &fixtures::support_requests(),
            fixtures::pending_support_request("Road permit"),
        )
        .unwrap();

    assert!(
        eventually(WAIT, || {
            manager
                .cache()
                .fetch_count(&BadgeDomain::Support.cache_key())
                >= 2
        })
        .await
    );
    badges.settled().await;
    assert_eq!(badges.count(BadgeDomain::Support), 2);
    assert!(manager.is_live(&fixtures::support_requests()));
}
