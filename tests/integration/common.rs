use listing_watch::config::{
    BanDetectionConfig, Config, CrawlerConfig, IdentityConfig, RateLimitConfig, StoreConfig,
    TargetEntry,
};
use listing_watch::{ChangeEvent, Coordinator};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Creates a fast test configuration crawling the given seeds
pub fn create_test_config(dir: &TempDir, seeds: Vec<String>) -> Config {
    Config {
        crawler: CrawlerConfig {
            max_workers: 2,
            max_attempts: 5,
            base_delay_ms: 10,
            fetch_timeout_secs: 2,
            max_redirects: 3,
            cycle_interval_secs: 1,
            removal_markers: vec!["/removed".to_string()],
        },
        rate_limit: RateLimitConfig {
            capacity: 50,
            refill_rate: 100.0,
            max_in_flight: 4,
            jitter_min_ms: 0,
            jitter_max_ms: 0,
        },
        ban_detection: BanDetectionConfig {
            window: 20,
            min_samples: 10,
            threshold: 0.4,
            backoff_factor: 0.25,
            cooldown_secs: 300,
        },
        identity: IdentityConfig {
            pool_size: 2,
            checkout_timeout_ms: 200,
            burn_cooldown_secs: 0,
            probe_chance: 0.0,
            min_host_reuse_ms: 0,
            user_agents: vec![
                "listing-watch-test/1.0".to_string(),
                "listing-watch-test/2.0".to_string(),
            ],
            egress_routes: vec![],
        },
        store: StoreConfig {
            database_path: dir.path().join("listings.db").to_string_lossy().into_owned(),
            removal_grace_cycles: 2,
            events_path: None,
        },
        targets: vec![TargetEntry {
            host: "127.0.0.1".to_string(),
            seeds,
            priority: 0,
        }],
    }
}

pub fn create_coordinator(config: Config) -> (Coordinator, mpsc::Receiver<ChangeEvent>) {
    let (tx, rx) = mpsc::channel(256);
    let coordinator =
        Coordinator::new(config, "integration".to_string(), tx).expect("Failed to build coordinator");
    (coordinator, rx)
}

/// API payload of a two-room flat
pub fn listing_body(id: u64, price: i64) -> String {
    format!(
        r#"{{
            "cianId": {id},
            "bargainTerms": {{"priceRur": {price}, "currency": "rur"}},
            "totalArea": 54.3,
            "roomsCount": 2,
            "floorNumber": 7,
            "building": {{"floorsCount": 12, "hasElevator": true}},
            "geo": {{
                "districts": [{{"name": "Tverskoy"}}],
                "undergrounds": [{{"name": "Mayakovskaya", "time": 6}}]
            }}
        }}"#
    )
}

/// Drains events already sitting in the channel
pub fn drain_events(rx: &mut mpsc::Receiver<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn kinds(events: &[ChangeEvent]) -> Vec<String> {
    events
        .iter()
        .map(|event| format!("{}:{}", event.kind(), event.source_id()))
        .collect()
}
