//! Crawl task bookkeeping
//!
//! A `CrawlTask` carries one URL through the queue together with its attempt
//! count and the earliest instant it may be dispatched again. `RetryPolicy`
//! turns a soft failure into either a delayed retry or a final drop.

use crate::config::CrawlerConfig;
use rand::Rng;
use std::cmp::Ordering;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// Upper bound on a single retry delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Retry settings applied to soft failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the first retry, doubled per attempt
    pub base_delay: Duration,

    /// Attempts allowed before a task is dropped
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_attempts: config.max_attempts,
        }
    }

    /// Computes `base_delay * 2^attempt_count * jitter` with jitter in [0.5, 1.5)
    pub fn retry_delay<R: Rng + ?Sized>(&self, attempt_count: u32, rng: &mut R) -> Duration {
        let jitter: f64 = rng.gen_range(0.5..1.5);
        let factor = 2f64.powi(attempt_count.min(30) as i32) * jitter;
        let secs = (self.base_delay.as_secs_f64() * factor).min(MAX_RETRY_DELAY.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// What happens to a task after a soft failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue the task; it becomes eligible at the given instant
    Retry { eligible_at: Instant },

    /// The attempt budget is spent; drop the task
    Exhausted,
}

/// A listing URL queued for fetching, with its retry state
#[derive(Debug, Clone)]
pub struct CrawlTask {
    /// The URL to fetch
    pub url: Url,

    /// Host the URL belongs to (rate limits and ban detection key)
    pub target_host: String,

    /// Listing key; at most one task per key is in flight
    pub source_key: String,

    /// Queue priority (lower is fetched first)
    pub priority: u32,

    /// Attempts made so far, never above the policy's `max_attempts`
    pub attempt_count: u32,

    /// Earliest instant the task may be dispatched
    pub next_eligible_time: Instant,
}

impl CrawlTask {
    pub fn new(
        url: Url,
        target_host: String,
        source_key: String,
        priority: u32,
        now: Instant,
    ) -> Self {
        Self {
            url,
            target_host,
            source_key,
            priority,
            attempt_count: 0,
            next_eligible_time: now,
        }
    }

    /// Checks whether the task may be dispatched at `now`
    pub fn is_eligible(&self, now: Instant) -> bool {
        now >= self.next_eligible_time
    }

    /// Postpones the task without spending an attempt
    ///
    /// Used when the governor or identity pool cannot serve the task right now.
    pub fn defer_until(&mut self, until: Instant) {
        if until > self.next_eligible_time {
            self.next_eligible_time = until;
        }
    }

    /// Spends one attempt on a soft failure and decides whether to retry
    ///
    /// The delay uses the attempt count before the increment, so the first
    /// retry waits roughly `base_delay`.
    pub fn record_soft_failure<R: Rng + ?Sized>(
        &mut self,
        now: Instant,
        policy: &RetryPolicy,
        rng: &mut R,
    ) -> RetryDecision {
        let delay = policy.retry_delay(self.attempt_count, rng);
        self.attempt_count = (self.attempt_count + 1).min(policy.max_attempts);

        if self.attempt_count >= policy.max_attempts {
            return RetryDecision::Exhausted;
        }

        self.next_eligible_time = now + delay;
        RetryDecision::Retry {
            eligible_at: self.next_eligible_time,
        }
    }
}

// Lower priority values pop first; among equal priorities the task that
// became eligible earliest pops first.
impl Ord for CrawlTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.next_eligible_time.cmp(&self.next_eligible_time))
            .then_with(|| other.url.as_str().cmp(self.url.as_str()))
    }
}

impl PartialOrd for CrawlTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for CrawlTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CrawlTask {}
