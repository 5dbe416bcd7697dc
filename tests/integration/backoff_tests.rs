//! Host ban detection and identity rotation under soft failures

use crate::common::{create_coordinator, create_test_config, drain_events};
use listing_watch::state::HostMode;
use listing_watch::IdentityHealth;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_host_enters_backoff_after_soft_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .expect(10)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let seeds = (1..=10)
        .map(|id| format!("{}/sale/flat/{}/", server.uri(), id))
        .collect();
    let mut config = create_test_config(&dir, seeds);
    config.crawler.max_attempts = 1;
    let refill_rate = config.rate_limit.refill_rate;
    let (mut coordinator, mut rx) = create_coordinator(config);
    coordinator.submit_targets();

    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.failures.len(), 10);
    assert!(report.failures.iter().all(|f| f.reason == "HTTP 429"));
    assert!(drain_events(&mut rx).is_empty());

    let host = coordinator.host_state("127.0.0.1").unwrap();
    assert!(matches!(host.mode, HostMode::Backoff { .. }));
    assert_eq!(host.total_soft_failures, 10);

    let rate = coordinator.governor().effective_rate("127.0.0.1");
    assert!((rate - refill_rate * 0.25).abs() < 1e-9);

    // The identity that carried the failure that tripped the backoff is burned
    assert!(coordinator
        .identities()
        .health_snapshot()
        .contains(&IdentityHealth::Burned));
}

#[tokio::test]
async fn test_successes_keep_host_normal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let seeds = (1..=12)
        .map(|id| format!("{}/sale/flat/{}/", server.uri(), id))
        .collect();
    let (mut coordinator, _rx) = create_coordinator(create_test_config(&dir, seeds));
    coordinator.submit_targets();

    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    // Hard failures never count toward ban detection
    assert_eq!(report.failures.len(), 12);
    let host = coordinator.host_state("127.0.0.1").unwrap();
    assert_eq!(host.mode, HostMode::Normal);
    assert_eq!(host.failure_ratio(10), Some(0.0));
    assert_eq!(coordinator.governor().effective_rate("127.0.0.1"), 100.0);
    assert!(coordinator
        .identities()
        .health_snapshot()
        .iter()
        .all(|health| *health == IdentityHealth::Healthy));
}
