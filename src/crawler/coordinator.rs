//! Crawler coordinator - crawl cycle orchestration
//!
//! This module contains the dispatch loop that drives one crawl cycle:
//! - Seeding the scheduler from configured targets
//! - Gating dispatch through the rate governor and worker slots
//! - Running fetch workers, each with an exclusively checked-out identity
//! - Applying retry, deferral and host ban-detection policy to outcomes
//! - Normalizing and ingesting successful fetches into the store
//! - Sweeping unseen listings and recording the cycle
//!
//! All decisions and all store access happen on the coordinator's own task;
//! workers only perform network I/O.

use crate::config::Config;
use crate::crawler::fetcher::{FetchOutcome, FetchWorkerPool};
use crate::crawler::scheduler::Scheduler;
use crate::governor::{Permit, RateGovernor, WouldBlock};
use crate::identity::{Identity, IdentityPool, PoolExhausted};
use crate::listing::{normalize, CanonicalListing, RawPage};
use crate::state::{CrawlTask, HostState, HostTransition, RetryDecision, RetryPolicy};
use crate::storage::{ChangeEvent, CycleCounts, CycleStatus, ListingStore, SqliteStorage};
use crate::url::{extract_host, listing_key, normalize_url};
use crate::WatchError;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shortest deferral applied when a task cannot be dispatched right now
const MIN_DEFERRAL: Duration = Duration::from_millis(10);

/// A task dropped for good during a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalFailure {
    pub url: String,
    pub source_key: String,
    pub attempts: u32,
    pub reason: String,
}

/// Summary of one crawl cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// ID of the cycle row in storage
    pub cycle_id: i64,

    /// Fetch and event tallies
    pub counts: CycleCounts,

    /// Soft failures that were scheduled for another attempt
    pub retries: u64,

    /// Dispatches postponed by the governor or identity pool
    pub deferrals: u64,

    /// Ingests that failed in storage
    pub storage_errors: u64,

    /// Tasks dropped after a hard failure or an exhausted attempt budget
    pub failures: Vec<TerminalFailure>,

    /// Whether the cycle stopped early on cancellation
    pub cancelled: bool,

    pub elapsed: Duration,
}

/// What a fetch worker hands back to the coordinator
struct WorkerOutput {
    task: CrawlTask,
    permit: Option<Permit>,
    result: WorkerResult,
}

enum WorkerResult {
    Fetched {
        outcome: FetchOutcome,
        identity: Identity,
        observed_at: DateTime<Utc>,
    },
    NoIdentity(PoolExhausted),
    Crashed(String),
}

/// Main crawl coordinator structure
pub struct Coordinator {
    config: Arc<Config>,
    storage: SqliteStorage,
    scheduler: Scheduler,
    governor: Arc<RateGovernor>,
    identities: Arc<IdentityPool>,
    workers: Arc<FetchWorkerPool>,
    hosts: HashMap<String, HostState>,
    retry_policy: RetryPolicy,
    events: mpsc::Sender<ChangeEvent>,
    config_hash: String,
    consumer_gone: bool,
}

impl Coordinator {
    /// Creates a new coordinator instance
    ///
    /// # Arguments
    ///
    /// * `config` - The validated configuration
    /// * `config_hash` - Hash of the configuration file, recorded with each cycle
    /// * `events` - Channel receiving every change event
    ///
    /// # Returns
    ///
    /// * `Ok(Coordinator)` - Successfully created coordinator
    /// * `Err(WatchError)` - Failed to open storage or build identity clients
    pub fn new(
        config: Config,
        config_hash: String,
        events: mpsc::Sender<ChangeEvent>,
    ) -> Result<Self, WatchError> {
        let storage = SqliteStorage::new(Path::new(&config.store.database_path))?;
        let identities = IdentityPool::new(&config.identity, config.crawler.fetch_timeout())?;

        Ok(Self {
            governor: Arc::new(RateGovernor::new(&config.rate_limit)),
            identities: Arc::new(identities),
            workers: Arc::new(FetchWorkerPool::new(&config.crawler)),
            retry_policy: RetryPolicy::from_config(&config.crawler),
            scheduler: Scheduler::new(),
            hosts: HashMap::new(),
            config: Arc::new(config),
            storage,
            events,
            config_hash,
            consumer_gone: false,
        })
    }

    /// Queues seed URLs for the next cycle
    ///
    /// URLs that fail normalization are logged and skipped. A URL whose listing
    /// key is already queued or in flight is ignored.
    ///
    /// # Returns
    ///
    /// The number of tasks actually queued
    pub fn submit<I, S>(&mut self, seeds: I, priority: u32) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let now = Instant::now();
        let mut queued = 0;

        for seed in seeds {
            let seed = seed.as_ref();
            let url = match normalize_url(seed) {
                Ok(url) => url,
                Err(e) => {
                    tracing::warn!(url = seed, error = %e, "Skipping malformed seed");
                    continue;
                }
            };
            let Some(host) = extract_host(&url) else {
                tracing::warn!(url = seed, "Skipping seed without host");
                continue;
            };

            let key = listing_key(&url);
            if self
                .scheduler
                .submit(CrawlTask::new(url, host, key, priority, now))
            {
                queued += 1;
            }
        }

        queued
    }

    /// Queues every configured target's seeds
    pub fn submit_targets(&mut self) -> usize {
        let config = Arc::clone(&self.config);
        config
            .targets
            .iter()
            .map(|target| self.submit(&target.seeds, target.priority))
            .sum()
    }

    /// Runs one crawl cycle until the queue drains or `cancel` fires
    ///
    /// On cancellation no new fetches are dispatched; fetches already in
    /// flight finish (or time out) and their outcomes are still processed.
    /// The removal sweep only runs for cycles that were not cancelled.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<CycleReport, WatchError> {
        let started = Instant::now();
        let cycle_id = self.storage.create_cycle(&self.config_hash)?;
        tracing::info!(
            cycle_id,
            queued = self.scheduler.queued_len(),
            "Starting crawl cycle"
        );

        let mut report = CycleReport {
            cycle_id,
            ..CycleReport::default()
        };
        let mut seen = HashSet::new();
        let mut running: JoinSet<WorkerOutput> = JoinSet::new();
        let mut completed: u64 = 0;

        loop {
            self.refresh_hosts();

            let saturated = if cancel.is_cancelled() {
                false
            } else {
                self.dispatch(&mut running, &mut report)
            };

            if running.is_empty() && (cancel.is_cancelled() || self.scheduler.is_empty()) {
                break;
            }

            // A saturated dispatch waits for a completion rather than a timer
            let wake = if saturated || cancel.is_cancelled() {
                None
            } else {
                self.scheduler.next_wake()
            };

            tokio::select! {
                Some(joined) = running.join_next() => {
                    self.handle_joined(joined, &mut report, &mut seen).await;
                    completed += 1;
                    if completed % 10 == 0 {
                        tracing::info!(
                            "Progress: {} fetches completed, {} queued, {} in flight",
                            completed,
                            self.scheduler.queued_len(),
                            running.len()
                        );
                    }
                }
                _ = sleep_until_wake(wake), if wake.is_some() => {}
                _ = cancel.cancelled(), if !cancel.is_cancelled() => {
                    tracing::info!(
                        in_flight = running.len(),
                        "Cancellation requested, draining in-flight fetches"
                    );
                }
                else => {
                    tracing::debug!("Nothing left to wait for");
                    break;
                }
            }
        }

        report.cancelled = cancel.is_cancelled();
        if !report.cancelled {
            let removed = self
                .storage
                .sweep(&seen, self.config.store.removal_grace_cycles)?;
            for event in removed {
                report.counts.record(&event);
                self.emit(event).await;
            }
        }

        report.counts.failures = report.failures.len() as u64;
        report.elapsed = started.elapsed();

        let status = if report.cancelled {
            CycleStatus::Interrupted
        } else {
            CycleStatus::Completed
        };
        self.storage.finish_cycle(cycle_id, status, &report.counts)?;

        tracing::info!(
            cycle_id,
            fetched = report.counts.fetched,
            new = report.counts.new,
            price_changed = report.counts.price_changed,
            fields_changed = report.counts.fields_changed,
            removed = report.counts.removed,
            failures = report.counts.failures,
            "Crawl cycle finished in {:?}",
            report.elapsed
        );

        Ok(report)
    }

    /// Dispatches every task that may start now
    ///
    /// Returns true when dispatch stopped because all worker slots or the
    /// global in-flight cap are taken.
    fn dispatch(&mut self, running: &mut JoinSet<WorkerOutput>, report: &mut CycleReport) -> bool {
        let now = Instant::now();
        self.scheduler.prune_holds(now);

        loop {
            let Some(slot) = self.workers.try_reserve() else {
                return true;
            };
            let Some(mut task) = self.scheduler.next_ready(now) else {
                return false;
            };

            let permit = match self.governor.acquire(&task.target_host) {
                Ok(permit) => permit,
                Err(WouldBlock::HostExhausted { retry_after, .. }) => {
                    tracing::trace!(
                        host = %task.target_host,
                        "Host out of tokens, deferring for {:?}",
                        retry_after
                    );
                    task.defer_until(now + retry_after.max(MIN_DEFERRAL));
                    self.scheduler.requeue(task);
                    report.deferrals += 1;
                    continue;
                }
                Err(WouldBlock::InFlightCap) => {
                    self.scheduler.requeue(task);
                    return true;
                }
            };

            let hold = self.governor.jitter_delay();
            self.scheduler.hold_host(&task.target_host, now + hold);

            tracing::debug!(
                url = %task.url,
                attempt = task.attempt_count + 1,
                "Dispatching fetch"
            );
            self.spawn_worker(running, task, permit, slot);
        }
    }

    fn spawn_worker(
        &self,
        running: &mut JoinSet<WorkerOutput>,
        task: CrawlTask,
        permit: Permit,
        slot: OwnedSemaphorePermit,
    ) {
        let identities = Arc::clone(&self.identities);
        let workers = Arc::clone(&self.workers);
        let snapshot = task.clone();

        running.spawn(async move {
            // The inner task isolates panics so the outer one can still
            // report which task was lost
            let job = tokio::spawn(fetch_job(task, permit, slot, identities, workers));
            match job.await {
                Ok(output) => output,
                Err(e) => WorkerOutput {
                    task: snapshot,
                    permit: None,
                    result: WorkerResult::Crashed(e.to_string()),
                },
            }
        });
    }

    async fn handle_joined(
        &mut self,
        joined: Result<WorkerOutput, JoinError>,
        report: &mut CycleReport,
        seen: &mut HashSet<String>,
    ) {
        let output = match joined {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(error = %e, "Fetch supervisor failed");
                return;
            }
        };

        let WorkerOutput {
            mut task,
            permit,
            result,
        } = output;

        match result {
            WorkerResult::NoIdentity(e) => {
                // The host token stays spent; only the in-flight slot is freed
                drop(permit);
                tracing::debug!(url = %task.url, error = %e, "No identity available, deferring");
                task.defer_until(Instant::now() + MIN_DEFERRAL);
                self.scheduler.requeue(task);
                report.deferrals += 1;
            }
            WorkerResult::Crashed(reason) => {
                tracing::error!(url = %task.url, reason = %reason, "Fetch worker crashed");
                self.retry_or_drop(task, reason, report);
            }
            WorkerResult::Fetched {
                outcome,
                identity,
                observed_at,
            } => {
                drop(permit);
                self.record_host_outcome(&task.target_host, &outcome, identity);

                match outcome {
                    FetchOutcome::Success { body, final_url, .. } => {
                        if final_url != task.url {
                            tracing::debug!(url = %task.url, final_url = %final_url, "Fetched after redirect");
                        }
                        let page = RawPage {
                            url: task.url.clone(),
                            body,
                            observed_at,
                        };
                        match normalize(&page) {
                            Ok(listing) => {
                                self.scheduler.finish(&task.source_key);
                                report.counts.fetched += 1;
                                self.ingest(listing, report, seen).await;
                            }
                            Err(e) => self.drop_task(task, e.to_string(), report),
                        }
                    }
                    FetchOutcome::SoftFailure { reason } => self.retry_or_drop(task, reason, report),
                    FetchOutcome::HardFailure { reason } => self.drop_task(task, reason, report),
                }
            }
        }
    }

    /// Feeds one fetch outcome into host ban detection and returns the identity
    fn record_host_outcome(&mut self, host: &str, outcome: &FetchOutcome, mut identity: Identity) {
        let soft = outcome.is_soft_failure();
        let ban_config = &self.config.ban_detection;
        let state = self.hosts.entry(host.to_string()).or_default();

        if state.record(soft, Instant::now(), ban_config) == HostTransition::EnteredBackoff {
            tracing::warn!(
                host,
                ratio = state.failure_ratio(ban_config.min_samples).unwrap_or_default(),
                "Host entered backoff"
            );
            self.governor.set_rate_factor(host, ban_config.backoff_factor);
        }

        if soft && state.in_backoff() {
            self.identities.mark_burned(&mut identity);
        }
        self.identities.release(identity, outcome.hint());
    }

    /// Clears backoff for hosts that stayed quiet for the cooldown
    fn refresh_hosts(&mut self) {
        let now = Instant::now();
        for (host, state) in self.hosts.iter_mut() {
            if state.refresh(now, &self.config.ban_detection) == HostTransition::ClearedBackoff {
                tracing::info!(host = %host, "Host left backoff");
                self.governor.set_rate_factor(host, 1.0);
            }
        }
    }

    fn retry_or_drop(&mut self, mut task: CrawlTask, reason: String, report: &mut CycleReport) {
        let decision =
            task.record_soft_failure(Instant::now(), &self.retry_policy, &mut rand::thread_rng());

        match decision {
            RetryDecision::Retry { eligible_at } => {
                tracing::debug!(
                    url = %task.url,
                    attempt = task.attempt_count,
                    reason = %reason,
                    "Retrying in {:?}",
                    eligible_at.saturating_duration_since(Instant::now())
                );
                report.retries += 1;
                self.scheduler.requeue(task);
            }
            RetryDecision::Exhausted => self.drop_task(task, reason, report),
        }
    }

    /// Drops a task and reports it as a terminal failure
    fn drop_task(&mut self, task: CrawlTask, reason: String, report: &mut CycleReport) {
        tracing::warn!(
            url = %task.url,
            attempts = task.attempt_count,
            reason = %reason,
            "Giving up on listing"
        );
        self.scheduler.finish(&task.source_key);
        report.failures.push(TerminalFailure {
            url: task.url.to_string(),
            source_key: task.source_key,
            attempts: task.attempt_count,
            reason,
        });
    }

    async fn ingest(
        &mut self,
        listing: CanonicalListing,
        report: &mut CycleReport,
        seen: &mut HashSet<String>,
    ) {
        // A listing that was fetched counts as seen even if storing it fails
        seen.insert(listing.source_id.clone());

        match self.storage.ingest(&listing) {
            Ok(event) => {
                report.counts.record(&event);
                self.emit(event).await;
            }
            Err(e) => {
                tracing::error!(
                    source_id = %listing.source_id,
                    error = %e,
                    "Failed to ingest listing"
                );
                report.storage_errors += 1;
            }
        }
    }

    async fn emit(&mut self, event: ChangeEvent) {
        if self.consumer_gone {
            return;
        }
        if self.events.send(event).await.is_err() {
            tracing::warn!("Event consumer closed, further events are dropped");
            self.consumer_gone = true;
        }
    }

    /// Returns the ban-detection state of a host, if it was fetched
    pub fn host_state(&self, host: &str) -> Option<&HostState> {
        self.hosts.get(host)
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    pub fn identities(&self) -> &IdentityPool {
        &self.identities
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Number of tasks waiting in the queue
    pub fn queued(&self) -> usize {
        self.scheduler.queued_len()
    }
}

/// Executes one task inside a worker: identity checkout, then the fetch
async fn fetch_job(
    task: CrawlTask,
    permit: Permit,
    _slot: OwnedSemaphorePermit,
    identities: Arc<IdentityPool>,
    workers: Arc<FetchWorkerPool>,
) -> WorkerOutput {
    let identity = match identities.checkout(&task.target_host).await {
        Ok(identity) => identity,
        Err(e) => {
            return WorkerOutput {
                task,
                permit: Some(permit),
                result: WorkerResult::NoIdentity(e),
            }
        }
    };
    let guard = identities.guard(&identity);

    let observed_at = Utc::now();
    let outcome = workers.execute(&task, &identity).await;
    guard.disarm();

    WorkerOutput {
        task,
        permit: Some(permit),
        result: WorkerResult::Fetched {
            outcome,
            identity,
            observed_at,
        },
    }
}

async fn sleep_until_wake(wake: Option<Instant>) {
    if let Some(at) = wake {
        tokio::time::sleep_until(at).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BanDetectionConfig, CrawlerConfig, IdentityConfig, RateLimitConfig, StoreConfig,
        TargetEntry,
    };
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_config(dir: &TempDir, seeds: Vec<String>) -> Config {
        Config {
            crawler: CrawlerConfig {
                max_workers: 2,
                max_attempts: 2,
                base_delay_ms: 10,
                fetch_timeout_secs: 2,
                ..CrawlerConfig::default()
            },
            rate_limit: RateLimitConfig {
                capacity: 10,
                refill_rate: 100.0,
                max_in_flight: 4,
                jitter_min_ms: 0,
                jitter_max_ms: 0,
            },
            ban_detection: BanDetectionConfig::default(),
            identity: IdentityConfig {
                pool_size: 2,
                checkout_timeout_ms: 500,
                burn_cooldown_secs: 60,
                probe_chance: 0.0,
                min_host_reuse_ms: 0,
                user_agents: vec!["listing-watch-test/1.0".to_string()],
                egress_routes: vec![],
            },
            store: StoreConfig {
                database_path: dir.path().join("watch.db").to_string_lossy().into_owned(),
                removal_grace_cycles: 1,
                events_path: None,
            },
            targets: vec![TargetEntry {
                host: "127.0.0.1".to_string(),
                seeds,
                priority: 0,
            }],
        }
    }

    fn create_coordinator(config: Config) -> (Coordinator, mpsc::Receiver<ChangeEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let coordinator = Coordinator::new(config, "test-hash".to_string(), tx).unwrap();
        (coordinator, rx)
    }

    #[test]
    fn test_submit_skips_duplicates_and_malformed_seeds() {
        let dir = TempDir::new().unwrap();
        let (mut coordinator, _rx) = create_coordinator(create_test_config(&dir, vec![]));

        let queued = coordinator.submit(
            [
                "https://cian.ru/sale/flat/1/",
                "https://www.cian.ru/sale/flat/1/?utm_source=tg",
                "not a url",
                "ftp://cian.ru/sale/flat/2/",
                "https://cian.ru/sale/flat/3/",
            ],
            0,
        );

        assert_eq!(queued, 2);
        assert_eq!(coordinator.queued(), 2);
    }

    #[tokio::test]
    async fn test_cycle_ingests_and_drops_hard_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sale/flat/101/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"cianId": 101, "price": 4200000, "roomsCount": 2}"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sale/flat/102/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let seeds = vec![
            format!("{}/sale/flat/101/", server.uri()),
            format!("{}/sale/flat/102/", server.uri()),
        ];
        let (mut coordinator, mut rx) = create_coordinator(create_test_config(&dir, seeds));
        assert_eq!(coordinator.submit_targets(), 2);

        let report = coordinator.run(CancellationToken::new()).await.unwrap();

        assert!(!report.cancelled);
        assert_eq!(report.counts.fetched, 1);
        assert_eq!(report.counts.new, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].reason, "HTTP 404");
        assert_eq!(report.failures[0].attempts, 0);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "new");
        assert_eq!(event.source_id(), "101");

        let cycle = coordinator.storage().get_cycle(report.cycle_id).unwrap();
        assert_eq!(cycle.status, CycleStatus::Completed);
        assert_eq!(cycle.counts.new, 1);
        assert_eq!(coordinator.identities().idle_count(), 2);
    }

    #[tokio::test]
    async fn test_soft_failures_exhaust_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sale/flat/7/"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let seeds = vec![format!("{}/sale/flat/7/", server.uri())];
        let (mut coordinator, _rx) = create_coordinator(create_test_config(&dir, seeds));
        coordinator.submit_targets();

        let report = coordinator.run(CancellationToken::new()).await.unwrap();

        assert_eq!(report.retries, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].attempts, 2);
        assert_eq!(report.counts.failures, 1);
        assert_eq!(coordinator.queued(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_skips_sweep() {
        let dir = TempDir::new().unwrap();
        let seeds = vec!["https://127.0.0.1/sale/flat/1/".to_string()];
        let (mut coordinator, _rx) = create_coordinator(create_test_config(&dir, seeds));
        coordinator.submit_targets();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = coordinator.run(cancel).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.counts.fetched, 0);
        assert_eq!(report.counts.removed, 0);

        let cycle = coordinator.storage().get_cycle(report.cycle_id).unwrap();
        assert_eq!(cycle.status, CycleStatus::Interrupted);
    }
}
