//! Scheduler for the crawl task queue
//!
//! This module handles:
//! - Priority queue management for tasks to fetch
//! - At most one task per listing key, queued or in flight
//! - Per-task eligibility times (retry backoff and deferrals)
//! - Per-host jitter holds between dispatches
//!
//! The scheduler never waits. It reports the next instant at which something
//! may become ready and leaves the waiting to the coordinator.

use crate::state::CrawlTask;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tokio::time::Instant;

/// Queue of crawl tasks with eligibility tracking
#[derive(Debug, Default)]
pub struct Scheduler {
    /// Tasks waiting to be dispatched (lower priority values pop first)
    queue: BinaryHeap<CrawlTask>,

    /// Listing keys of queued tasks
    queued_keys: HashSet<String>,

    /// Listing keys of dispatched tasks that have not finished
    in_flight: HashSet<String>,

    /// Hosts that may not receive another dispatch until the given instant
    host_holds: HashMap<String, Instant>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new task to the queue
    ///
    /// # Returns
    ///
    /// `false` if a task for the same listing key is already queued or in
    /// flight; the new task is dropped in that case.
    pub fn submit(&mut self, task: CrawlTask) -> bool {
        if self.queued_keys.contains(&task.source_key) || self.in_flight.contains(&task.source_key) {
            tracing::trace!(key = %task.source_key, "Ignoring duplicate task");
            return false;
        }
        self.queued_keys.insert(task.source_key.clone());
        self.queue.push(task);
        true
    }

    /// Puts a dispatched task back into the queue (retry or deferral)
    pub fn requeue(&mut self, task: CrawlTask) {
        self.in_flight.remove(&task.source_key);
        self.queued_keys.insert(task.source_key.clone());
        self.queue.push(task);
    }

    /// Marks a dispatched task as done for good
    pub fn finish(&mut self, source_key: &str) {
        self.in_flight.remove(source_key);
    }

    /// Holds a host until `until`, e.g. for the jitter window after a dispatch
    pub fn hold_host(&mut self, host: &str, until: Instant) {
        let hold = self.host_holds.entry(host.to_string()).or_insert(until);
        if until > *hold {
            *hold = until;
        }
    }

    fn host_ready_at(&self, host: &str) -> Option<Instant> {
        self.host_holds.get(host).copied()
    }

    /// Pops the highest-priority task that may be dispatched at `now`
    ///
    /// The returned task counts as in flight until it is requeued or finished.
    pub fn next_ready(&mut self, now: Instant) -> Option<CrawlTask> {
        let mut not_ready = Vec::new();
        let mut found = None;

        while let Some(task) = self.queue.pop() {
            let host_free = self
                .host_ready_at(&task.target_host)
                .map(|at| now >= at)
                .unwrap_or(true);

            if task.is_eligible(now) && host_free {
                found = Some(task);
                break;
            }
            not_ready.push(task);
        }

        for task in not_ready {
            self.queue.push(task);
        }

        let task = found?;
        self.queued_keys.remove(&task.source_key);
        self.in_flight.insert(task.source_key.clone());
        tracing::trace!(url = %task.url, "Task ready for dispatch");
        Some(task)
    }

    /// Earliest instant at which a queued task could become ready
    ///
    /// Returns `None` when nothing is queued.
    pub fn next_wake(&self) -> Option<Instant> {
        self.queue
            .iter()
            .map(|task| match self.host_ready_at(&task.target_host) {
                Some(hold) => hold.max(task.next_eligible_time),
                None => task.next_eligible_time,
            })
            .min()
    }

    /// Drops expired host holds
    pub fn prune_holds(&mut self, now: Instant) {
        self.host_holds.retain(|_, until| *until > now);
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns whether no task is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_in_flight(&self, source_key: &str) -> bool {
        self.in_flight.contains(source_key)
    }
}
