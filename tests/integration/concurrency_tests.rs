//! Crawl cycles under concurrent load

use crate::common::{create_coordinator, create_test_config, drain_events, listing_body};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const RESPONSE_DELAY: Duration = Duration::from_millis(100);

/// Answers the first request for each listing with 503 and later ones with
/// the listing payload, recording when each request arrived
#[derive(Clone, Default)]
struct FlakyListings {
    arrivals: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
}

impl Respond for FlakyListings {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let path = request.url.path().to_string();
        let mut arrivals = self.arrivals.lock().unwrap();
        let seen = arrivals.entry(path.clone()).or_default();
        seen.push(Instant::now());

        let template = if seen.len() == 1 {
            ResponseTemplate::new(503)
        } else {
            let id: u64 = path
                .trim_matches('/')
                .rsplit('/')
                .next()
                .and_then(|segment| segment.parse().ok())
                .unwrap();
            ResponseTemplate::new(200).set_body_string(listing_body(id, 6_000_000 + id as i64))
        };
        template.set_delay(RESPONSE_DELAY)
    }
}

#[tokio::test]
async fn test_one_fetch_per_listing_in_flight_under_load() {
    let server = MockServer::start().await;
    let responder = FlakyListings::default();
    Mock::given(method("GET"))
        .respond_with(responder.clone())
        .mount(&server)
        .await;

    let ids: Vec<u64> = (801..813).collect();
    let seeds = ids
        .iter()
        .flat_map(|id| {
            [
                format!("{}/sale/flat/{}/", server.uri(), id),
                format!("{}/sale/flat/{}/?from=map", server.uri(), id),
                format!("{}/sale/flat/{}/?from=list", server.uri(), id),
            ]
        })
        .collect();

    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(&dir, seeds);
    config.crawler.max_workers = 6;
    config.rate_limit.max_in_flight = 6;
    config.identity.pool_size = 6;
    config.ban_detection.threshold = 0.95;
    let (mut coordinator, mut rx) = create_coordinator(config);

    assert_eq!(coordinator.submit_targets(), ids.len());
    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert!(report.failures.is_empty());
    assert_eq!(report.retries, ids.len() as u64);
    assert_eq!(report.counts.new, ids.len() as u64);
    assert_eq!(drain_events(&mut rx).len(), ids.len());

    let arrivals = responder.arrivals.lock().unwrap();
    assert_eq!(arrivals.len(), ids.len());
    for (path, times) in arrivals.iter() {
        assert_eq!(times.len(), 2, "{} fetched {} times", path, times.len());
        // A retry may only start once the previous response came back
        for pair in times.windows(2) {
            assert!(
                pair[1].duration_since(pair[0]) >= RESPONSE_DELAY,
                "overlapping fetches for {}",
                path
            );
        }
    }

    // Different listings did overlap, so the cycle really ran concurrently
    let mut firsts: Vec<Instant> = arrivals.values().map(|times| times[0]).collect();
    firsts.sort();
    assert!(firsts
        .windows(2)
        .any(|pair| pair[1].duration_since(pair[0]) < RESPONSE_DELAY));
}
