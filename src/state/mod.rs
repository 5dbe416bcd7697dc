//! State module for tracking crawl progress
//!
//! This module holds the explicit state machines driving the crawl.
//!
//! # Components
//!
//! - `CrawlTask`: a queued fetch with its retry bookkeeping
//! - `HostState`: per-host sliding failure window and BACKOFF transitions
//! - `IdentityHealth`: rotation eligibility of a client identity

mod health;
mod host_state;
mod task_state;

pub use health::IdentityHealth;
pub use host_state::{HostMode, HostState, HostTransition};
pub use task_state::{CrawlTask, RetryDecision, RetryPolicy};
