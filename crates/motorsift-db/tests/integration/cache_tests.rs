use std::time::Duration;

use motorsift_core::cache::{CacheEntry, TtlClass};
use motorsift_core::models::CachedAggregate;
use motorsift_core::testutil::sample_listings;
use motorsift_core::traits::DurableCache;
use motorsift_db::CacheRepository;

use crate::integration::common::setup_test_db;

fn aggregate(source: &str, n: usize) -> CachedAggregate {
    CachedAggregate {
        listings: sample_listings(source, n),
        sources_succeeded: vec![source.to_string()],
        sources_failed: Vec::new(),
        sources_skipped: Vec::new(),
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn put_then_get_returns_payload() {
    let (pool, _container) = setup_test_db().await;
    let repo = CacheRepository::new(pool);

    let entry = CacheEntry::new("key-1", aggregate("alpha", 3), TtlClass::Hot, Duration::from_secs(60));
    repo.put(&entry).await.unwrap();

    let stored = repo.get("key-1").await.unwrap().expect("entry should exist");
    assert_eq!(stored.key, "key-1");
    assert_eq!(stored.ttl_class, TtlClass::Hot);
    assert_eq!(stored.payload.listings, entry.payload.listings);
    assert_eq!(stored.payload.sources_succeeded, vec!["alpha".to_string()]);
    assert!(repo.get("missing").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn put_overwrites_existing_key() {
    let (pool, _container) = setup_test_db().await;
    let repo = CacheRepository::new(pool);

    repo.put(&CacheEntry::new("key", aggregate("alpha", 1), TtlClass::Hot, Duration::from_secs(60)))
        .await
        .unwrap();
    repo.put(&CacheEntry::new("key", aggregate("beta", 4), TtlClass::Warm, Duration::from_secs(600)))
        .await
        .unwrap();

    let stored = repo.get("key").await.unwrap().unwrap();
    assert_eq!(stored.ttl_class, TtlClass::Warm);
    assert_eq!(stored.payload.listings.len(), 4);
    assert_eq!(repo.count().await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn invalidate_removes_entry() {
    let (pool, _container) = setup_test_db().await;
    let repo = CacheRepository::new(pool);

    repo.put(&CacheEntry::new("gone", aggregate("alpha", 1), TtlClass::Hot, Duration::from_secs(60)))
        .await
        .unwrap();
    repo.invalidate("gone").await.unwrap();
    repo.invalidate("never-existed").await.unwrap();

    assert!(repo.get("gone").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn purge_expired_keeps_live_entries() {
    let (pool, _container) = setup_test_db().await;
    let repo = CacheRepository::new(pool);

    repo.put(&CacheEntry::new("stale", aggregate("alpha", 1), TtlClass::Hot, Duration::ZERO))
        .await
        .unwrap();
    repo.put(&CacheEntry::new("fresh", aggregate("alpha", 1), TtlClass::Warm, Duration::from_secs(3600)))
        .await
        .unwrap();

    let purged = repo.purge_expired().await.unwrap();

    assert_eq!(purged, 1);
    assert!(repo.get("stale").await.unwrap().is_none());
    assert!(repo.get("fresh").await.unwrap().is_some());
}
