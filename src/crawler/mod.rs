//! Crawler module for listing fetching and cycle orchestration
//!
//! This module contains the core crawling logic, including:
//! - Task queueing with per-listing deduplication and eligibility times
//! - HTTP fetching with redirect and failure classification
//! - Cycle coordination: rate gating, identities, retries and ingest

mod coordinator;
mod fetcher;
mod scheduler;

pub use coordinator::{Coordinator, CycleReport, TerminalFailure};
pub use fetcher::{FetchOutcome, FetchWorkerPool};
pub use scheduler::Scheduler;

use crate::config::Config;
use crate::storage::ChangeEvent;
use crate::WatchError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Runs a single crawl cycle over every configured target
///
/// This is the main entry point for a one-shot crawl. It will:
/// 1. Open the store and build the identity pool
/// 2. Queue the seeds of every target
/// 3. Fetch, normalize and ingest until the queue drains
/// 4. Sweep listings that were not seen and record the cycle
///
/// # Arguments
///
/// * `config` - The crawler configuration
/// * `config_hash` - Hash of the configuration file
/// * `events` - Channel receiving every change event
/// * `cancel` - Stops dispatching new fetches when triggered
///
/// # Returns
///
/// * `Ok(CycleReport)` - Cycle finished (possibly cancelled)
/// * `Err(WatchError)` - Cycle could not be started or recorded
pub async fn crawl_once(
    config: Config,
    config_hash: String,
    events: mpsc::Sender<ChangeEvent>,
    cancel: CancellationToken,
) -> Result<CycleReport, WatchError> {
    let mut coordinator = Coordinator::new(config, config_hash, events)?;
    coordinator.submit_targets();
    coordinator.run(cancel).await
}
