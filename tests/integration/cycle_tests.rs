//! End-to-end crawl cycle tests

use crate::common::{create_coordinator, create_test_config, drain_events, kinds, listing_body};
use listing_watch::storage::{CycleStatus, ListingStore};
use listing_watch::ChangeEvent;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_price_change_detected_across_cycles() {
    let server = MockServer::start().await;

    // First two fetches see the original price, later ones the reduced price
    Mock::given(method("GET"))
        .and(path("/sale/flat/101/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_body(101, 4_200_000)))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sale/flat/101/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_body(101, 4_000_000)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, vec![format!("{}/sale/flat/101/", server.uri())]);
    let (mut coordinator, mut rx) = create_coordinator(config);

    // Cycle 1: first sighting
    coordinator.submit_targets();
    let report = coordinator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.counts.new, 1);
    assert_eq!(kinds(&drain_events(&mut rx)), vec!["new:101"]);

    // Cycle 2: same payload
    coordinator.submit_targets();
    let report = coordinator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.counts.unchanged, 1);
    assert_eq!(kinds(&drain_events(&mut rx)), vec!["unchanged:101"]);

    // Cycle 3: price drop
    coordinator.submit_targets();
    let report = coordinator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.counts.price_changed, 1);

    let events = drain_events(&mut rx);
    assert_eq!(events.len(), 1);
    match &events[0] {
        ChangeEvent::PriceChanged {
            old_price,
            new_price,
            record,
        } => {
            assert_eq!(*old_price, 4_200_000);
            assert_eq!(*new_price, 4_000_000);
            assert_eq!(record.current_price, 4_000_000);
            assert_eq!(record.currency, "RUB");
        }
        other => panic!("expected PriceChanged, got {:?}", other),
    }

    let history = coordinator.storage().get_history("101").unwrap();
    let prices: Vec<i64> = history.iter().map(|entry| entry.price).collect();
    assert_eq!(prices, vec![4_200_000, 4_000_000]);

    let cycles = coordinator.storage().get_recent_cycles(10).unwrap();
    assert_eq!(cycles.len(), 3);
    assert!(cycles
        .iter()
        .all(|cycle| cycle.status == CycleStatus::Completed));
}

#[tokio::test]
async fn test_soft_failures_are_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sale/flat/202/"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sale/flat/202/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_body(202, 7_750_000)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, vec![format!("{}/sale/flat/202/", server.uri())]);
    let (mut coordinator, mut rx) = create_coordinator(config);
    coordinator.submit_targets();

    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.retries, 2);
    assert!(report.failures.is_empty());
    assert_eq!(report.counts.fetched, 1);
    assert_eq!(kinds(&drain_events(&mut rx)), vec!["new:202"]);
}

#[tokio::test]
async fn test_exhausted_task_fails_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sale/flat/303/"))
        .respond_with(ResponseTemplate::new(502))
        .expect(5)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, vec![format!("{}/sale/flat/303/", server.uri())]);
    let (mut coordinator, mut rx) = create_coordinator(config);
    coordinator.submit_targets();

    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].source_key, "303");
    assert_eq!(report.failures[0].attempts, 5);
    assert_eq!(report.failures[0].reason, "HTTP 502");
    assert_eq!(report.retries, 4);
    assert!(drain_events(&mut rx).is_empty());
}

#[tokio::test]
async fn test_duplicate_seeds_fetched_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sale/flat/404404/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_body(404404, 5_000_000)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let seeds = vec![
        format!("{}/sale/flat/404404/", server.uri()),
        format!("{}/sale/flat/404404/?utm_source=telegram", server.uri()),
        format!("{}/sale/flat/404404/#photos", server.uri()),
    ];
    let (mut coordinator, mut rx) = create_coordinator(create_test_config(&dir, seeds));

    assert_eq!(coordinator.submit_targets(), 1);
    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.counts.fetched, 1);
    assert_eq!(kinds(&drain_events(&mut rx)), vec!["new:404404"]);
}

#[tokio::test]
async fn test_removed_listing_reported_after_grace_cycles() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sale/flat/501/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_body(501, 3_100_000)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sale/flat/502/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_body(502, 3_300_000)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    // After the first sighting the listing redirects to the removal page
    Mock::given(method("GET"))
        .and(path("/sale/flat/502/"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "/removed?id=502"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let seeds = vec![
        format!("{}/sale/flat/501/", server.uri()),
        format!("{}/sale/flat/502/", server.uri()),
    ];
    let (mut coordinator, mut rx) = create_coordinator(create_test_config(&dir, seeds));

    coordinator.submit_targets();
    coordinator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(drain_events(&mut rx).len(), 2);

    // Missed once: still inside the grace period
    coordinator.submit_targets();
    let report = coordinator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.counts.removed, 0);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].reason.contains("listing removed"));
    assert_eq!(report.failures[0].attempts, 0);
    assert_eq!(kinds(&drain_events(&mut rx)), vec!["unchanged:501"]);

    // Missed twice: reported removed exactly once
    coordinator.submit_targets();
    let report = coordinator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.counts.removed, 1);
    let events = kinds(&drain_events(&mut rx));
    assert!(events.contains(&"removed:502".to_string()));
    assert!(events.contains(&"unchanged:501".to_string()));

    coordinator.submit_targets();
    let report = coordinator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.counts.removed, 0);

    let record = coordinator.storage().get_record("502").unwrap().unwrap();
    assert!(!record.active);
    assert_eq!(coordinator.storage().count_listings(true).unwrap(), 1);
}

#[tokio::test]
async fn test_cancellation_drains_in_flight_fetches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(listing_body(601, 9_900_000))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let seeds = (601..605)
        .map(|id| format!("{}/sale/flat/{}/", server.uri(), id))
        .collect();
    let mut config = create_test_config(&dir, seeds);
    config.crawler.max_workers = 1;
    let (mut coordinator, _rx) = create_coordinator(config);
    coordinator.submit_targets();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let report = coordinator.run(cancel).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.counts.fetched, 1);
    assert_eq!(coordinator.queued(), 3);

    let cycle = coordinator.storage().get_cycle(report.cycle_id).unwrap();
    assert_eq!(cycle.status, CycleStatus::Interrupted);
    assert_eq!(cycle.counts.fetched, 1);
}

#[tokio::test]
async fn test_crawl_once_runs_configured_targets() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sale/flat/701/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_body(701, 12_500_000)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, vec![format!("{}/sale/flat/701/", server.uri())]);
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);

    let report = listing_watch::crawler::crawl_once(
        config,
        "integration".to_string(),
        tx,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.counts.new, 1);
    assert_eq!(kinds(&drain_events(&mut rx)), vec!["new:701"]);
}
