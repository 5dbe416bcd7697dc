//! Fetch worker pool
//!
//! This module executes single fetches and classifies the result:
//! - Bounded concurrency through a fixed number of worker slots
//! - A hard timeout per fetch
//! - Manual redirect handling, so a permanent redirect to a removal page is
//!   recognized instead of silently followed
//! - Classification into success, retryable soft failure or hard failure
//!
//! Failures are returned as values; `execute` never errors.

use crate::config::CrawlerConfig;
use crate::identity::{FetchHint, Identity};
use crate::state::CrawlTask;
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

/// Result of one fetch attempt
#[derive(Debug)]
pub enum FetchOutcome {
    /// A 2xx response with its body
    Success {
        status: u16,
        body: String,
        headers: HeaderMap,
        /// URL that produced the response, after redirects
        final_url: Url,
    },

    /// Transient failure (timeout, 429, 5xx, connection error); retry-eligible
    SoftFailure { reason: String },

    /// Permanent failure (bad URL, 4xx, removal redirect); never retried
    HardFailure { reason: String },
}

impl FetchOutcome {
    pub fn is_soft_failure(&self) -> bool {
        matches!(self, Self::SoftFailure { .. })
    }

    /// How identity rotation should treat this outcome
    pub fn hint(&self) -> FetchHint {
        match self {
            Self::Success { .. } => FetchHint::Success,
            Self::SoftFailure { .. } => FetchHint::SoftFailure,
            Self::HardFailure { .. } => FetchHint::HardFailure,
        }
    }

    fn soft(reason: impl Into<String>) -> Self {
        Self::SoftFailure {
            reason: reason.into(),
        }
    }

    fn hard(reason: impl Into<String>) -> Self {
        Self::HardFailure {
            reason: reason.into(),
        }
    }
}

/// Bounded pool executing fetches with an identity's client
pub struct FetchWorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
    timeout: Duration,
    max_redirects: u32,
    removal_markers: Vec<String>,
}

impl FetchWorkerPool {
    pub fn new(config: &CrawlerConfig) -> Self {
        let size = config.max_workers as usize;
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
            timeout: config.fetch_timeout(),
            max_redirects: config.max_redirects,
            removal_markers: config.removal_markers.clone(),
        }
    }

    /// Reserves a worker slot if one is free
    ///
    /// The slot is released when the returned permit is dropped.
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().try_acquire_owned().ok()
    }

    /// Number of busy worker slots
    pub fn busy(&self) -> usize {
        self.size - self.slots.available_permits()
    }

    /// Fetches a task's URL with the given identity
    ///
    /// # Arguments
    ///
    /// * `task` - The task to fetch
    /// * `identity` - The checked-out identity whose client is used
    ///
    /// # Returns
    ///
    /// The classified outcome; a fetch exceeding the timeout is a soft failure
    pub async fn execute(&self, task: &CrawlTask, identity: &Identity) -> FetchOutcome {
        match tokio::time::timeout(self.timeout, self.fetch(task.url.clone(), identity)).await {
            Ok(outcome) => outcome,
            Err(_) => FetchOutcome::soft(format!("timed out after {:?}", self.timeout)),
        }
    }

    async fn fetch(&self, url: Url, identity: &Identity) -> FetchOutcome {
        let mut current = url;

        for _ in 0..=self.max_redirects {
            let response = match identity.client().get(current.clone()).send().await {
                Ok(response) => response,
                Err(e) => return classify_error(&e),
            };

            let status = response.status();
            if !status.is_redirection() {
                return classify_response(status, response, current).await;
            }

            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
            else {
                return FetchOutcome::hard(format!("HTTP {} without Location", status.as_u16()));
            };

            let next = match current.join(location) {
                Ok(next) => next,
                Err(e) => return FetchOutcome::hard(format!("bad redirect target: {}", e)),
            };

            let permanent = matches!(
                status,
                StatusCode::MOVED_PERMANENTLY | StatusCode::PERMANENT_REDIRECT
            );
            if permanent && self.is_removal_page(next.as_str()) {
                return FetchOutcome::hard(format!("listing removed (redirect to {})", next));
            }

            tracing::trace!(from = %current, to = %next, "Following redirect");
            current = next;
        }

        FetchOutcome::hard(format!("more than {} redirects", self.max_redirects))
    }

    fn is_removal_page(&self, target: &str) -> bool {
        self.removal_markers
            .iter()
            .any(|marker| target.contains(marker.as_str()))
    }
}

async fn classify_response(status: StatusCode, response: reqwest::Response, url: Url) -> FetchOutcome {
    if status.is_success() {
        let headers = response.headers().clone();
        return match response.text().await {
            Ok(body) => FetchOutcome::Success {
                status: status.as_u16(),
                body,
                headers,
                final_url: url,
            },
            Err(e) => FetchOutcome::soft(format!("failed to read body: {}", e)),
        };
    }

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        FetchOutcome::soft(format!("HTTP {}", status.as_u16()))
    } else {
        FetchOutcome::hard(format!("HTTP {}", status.as_u16()))
    }
}

fn classify_error(error: &reqwest::Error) -> FetchOutcome {
    if error.is_builder() {
        FetchOutcome::hard(format!("invalid request: {}", error))
    } else if error.is_timeout() {
        FetchOutcome::soft("request timeout")
    } else if error.is_connect() {
        FetchOutcome::soft(format!("connection failed: {}", error))
    } else {
        FetchOutcome::soft(error.to_string())
    }
}
