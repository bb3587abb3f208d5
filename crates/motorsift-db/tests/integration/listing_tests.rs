use motorsift_core::models::{HealthStatus, Listing, SearchRequest};
use motorsift_core::testutil::sample_listings;
use motorsift_core::traits::{ListingStore, SourceAdapter};
use motorsift_db::ListingRepository;

use crate::integration::common::setup_test_db;

fn civic(source: &str, id: &str, year: u16, price: u32) -> Listing {
    let mut listing = Listing::new(source, id, format!("{year} Honda Civic EX"));
    listing.make = Some("Honda".into());
    listing.model = Some("Civic".into());
    listing.year = Some(year);
    listing.price = Some(price);
    listing.mileage = Some(30_000);
    listing.vin = Some(" 1hgcm82633a004352 ".into());
    listing.media_urls = vec!["https://img.example/1.jpg".into()];
    listing
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn upsert_inserts_then_updates() {
    let (pool, _container) = setup_test_db().await;
    let repo = ListingRepository::new(pool);

    let written = repo.upsert_listings(&sample_listings("alpha", 3)).await.unwrap();
    assert_eq!(written, 3);

    let mut changed = sample_listings("alpha", 1);
    changed[0].price = Some(1);
    repo.upsert_listings(&changed).await.unwrap();

    assert_eq!(repo.count().await.unwrap(), 3);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn search_filters_and_prefixes_origin() {
    let (pool, _container) = setup_test_db().await;
    let repo = ListingRepository::new(pool);

    repo.upsert_listings(&[
        civic("dealer", "1", 2018, 15_000),
        civic("dealer", "2", 2021, 22_000),
        civic("market", "9", 2020, 19_000),
    ])
    .await
    .unwrap();
    repo.upsert_listings(&sample_listings("alpha", 2)).await.unwrap();

    let request = SearchRequest::new()
        .with_make("honda")
        .with_years(Some(2019), None)
        .with_price_range(None, Some(20_000));
    let found = repo.search(&request, 1, 50).await.unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].source, "local");
    assert_eq!(found[0].source_id, "market:9");
    assert_eq!(found[0].vin.as_deref(), Some("1HGCM82633A004352"));
    assert_eq!(found[0].media_urls, vec!["https://img.example/1.jpg".to_string()]);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn search_matches_free_text_and_paginates() {
    let (pool, _container) = setup_test_db().await;
    let repo = ListingRepository::new(pool).with_source_id("archive");

    repo.upsert_listings(&[
        civic("dealer", "1", 2018, 15_000),
        civic("dealer", "2", 2019, 16_000),
        civic("dealer", "3", 2020, 17_000),
    ])
    .await
    .unwrap();

    let request = SearchRequest::new().with_query("civic ex");
    let first = repo.search(&request, 1, 2).await.unwrap();
    let second = repo.search(&request, 2, 2).await.unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 1);
    assert!(first.iter().chain(&second).all(|l| l.source == "archive"));

    let none = repo.search(&SearchRequest::new().with_query("corolla"), 1, 10).await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn health_check_reports_healthy() {
    let (pool, _container) = setup_test_db().await;
    let repo = ListingRepository::new(pool);

    assert_eq!(repo.health_check().await.status, HealthStatus::Healthy);
}
