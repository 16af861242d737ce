//! Badge watcher demo.
//!
//! Wires the realtime core against an in-memory backend, applies a scripted
//! series of mutations and logs the admin badge counts after each one
//! settles.
//!
//! Configuration comes from the TOML file named by `PALIKA_CONFIG`, or from
//! `PALIKA_*` environment variables when it is unset.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use palika_core::{
    CacheKey, Filter, PalikaResult, PortalCollection, QueryOptions, RealtimeConfig, SortDirection,
};
use palika_realtime::telemetry::{init_tracing, TelemetryConfig};
use palika_realtime::{AdminBadges, SubscriptionManager};
use palika_storage::{InMemoryFeed, RecordsFetcher};
use serde_json::json;

/// Time given to listeners to pick up a notification before waiting on the
/// refetches it started.
const DELIVERY_GRACE: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(&TelemetryConfig::from_env())?;

    let config = load_config()?;
    config.validate()?;

    let feed = Arc::new(InMemoryFeed::new());
    seed(&feed)?;

    let manager = SubscriptionManager::from_config(Arc::clone(&feed), &config);

    let news = PortalCollection::News.name();
    let news_key = CacheKey::single("news-list");
    manager.cache().set(
        news_key.clone(),
        Arc::new(
            RecordsFetcher::new(Arc::clone(&feed), news.clone(), Filter::all()).with_options(
                QueryOptions::new()
                    .order_by("published_at", SortDirection::Desc)
                    .with_limit(5),
            ),
        ),
    );
    let _news_watch = manager.watch(news.clone(), [news_key.clone()]).await?;
    manager.cache().get(&news_key);

    let mut badges = AdminBadges::activated(manager.clone()).await?;
    report("initial load", &badges).await;

    let issues = PortalCollection::CommunityIssues.name();
    let donations = PortalCollection::Donations.name();
    let support = PortalCollection::SupportRequests.name();

    let pothole = feed.insert(
        &issues,
        json!({"title": "Pothole on ward 4 road", "status": "open"}),
    )?;
    report("issue reported", &badges).await;

    let pending = feed.records(&donations)?;
    if let Some(first) = pending.first() {
        feed.update(&donations, first.id, json!({"status": "verified"}))?;
    }
    report("donation verified", &badges).await;

    feed.insert(
        &support,
        json!({"subject": "Birth certificate copy", "status": "pending"}),
    )?;
    report("support request filed", &badges).await;

    feed.update(&issues, pothole.id, json!({"status": "resolved"}))?;
    report("issue resolved", &badges).await;

    feed.insert_many(
        &donations,
        (1..=3).map(|n| {
            json!({"donor": format!("donor-{}", n), "amount": n * 1000, "status": "pending"})
        }),
    )?;
    report("bulk donations imported", &badges).await;

    feed.insert(
        &news,
        json!({"title": "Ward meeting on Friday", "published_at": "2026-10-17T08:00:00Z"}),
    )?;
    tokio::time::sleep(DELIVERY_GRACE).await;
    manager.cache().settled(&news_key).await;
    if let Some(list) = manager.cache().get_records(&news_key) {
        tracing::info!(items = list.value().len(), stale = list.is_stale(), "news list refreshed");
    }

    badges.deactivate();
    let stats = manager.cache().stats();
    tracing::info!(
        hits = stats.hits,
        misses = stats.misses,
        fetches = stats.fetches,
        coalesced = stats.coalesced,
        failures = stats.failures,
        hit_rate = stats.hit_rate(),
        "cache stats"
    );
    Ok(())
}

fn load_config() -> PalikaResult<RealtimeConfig> {
    match std::env::var_os("PALIKA_CONFIG") {
        Some(path) => RealtimeConfig::from_path(&PathBuf::from(path)),
        None => Ok(RealtimeConfig::from_env()),
    }
}

fn seed(feed: &InMemoryFeed) -> PalikaResult<()> {
    let issues = PortalCollection::CommunityIssues.name();
    let donations = PortalCollection::Donations.name();
    let support = PortalCollection::SupportRequests.name();
    let news = PortalCollection::News.name();

    feed.insert_many(
        &issues,
        vec![
            json!({"title": "Broken streetlight", "status": "open"}),
            json!({"title": "Blocked drain", "status": "open"}),
            json!({"title": "Fallen tree", "status": "resolved"}),
        ],
    )?;
    feed.insert(
        &donations,
        json!({"donor": "school committee", "amount": 5000, "status": "pending"}),
    )?;
    feed.insert(&support, json!({"subject": "Land record query", "status": "pending"}))?;
    feed.insert(
        &news,
        json!({"title": "Budget hearing", "published_at": "2026-10-01T09:00:00Z"}),
    )?;
    Ok(())
}

async fn report(step: &str, badges: &AdminBadges<Arc<InMemoryFeed>>) {
    tokio::time::sleep(DELIVERY_GRACE).await;
    badges.settled().await;
    let counts = badges.counts();
    tracing::info!(
        step,
        issues = counts.issues,
        donations = counts.donations,
        support = counts.support,
        total = counts.total(),
        "badge counts"
    );
}
