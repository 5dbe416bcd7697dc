//! Statistics generation from the listing store
//!
//! This module provides functionality for extracting and displaying
//! store statistics and per-cycle reports.

use crate::crawler::CycleReport;
use crate::storage::{CycleRecord, ListingStore};
use crate::WatchError;

/// Number of recent cycles shown by `print_statistics`
const RECENT_CYCLES: u32 = 10;

/// Store statistics summary
#[derive(Debug, Clone)]
pub struct StoreStatistics {
    /// Listings seen within the removal grace period
    pub active_listings: u64,

    /// Listings reported removed
    pub removed_listings: u64,

    /// Observations kept across all listing histories
    pub history_entries: u64,

    /// Most recent cycles, newest first
    pub recent_cycles: Vec<CycleRecord>,
}

impl StoreStatistics {
    pub fn total_listings(&self) -> u64 {
        self.active_listings + self.removed_listings
    }
}

/// Loads statistics from storage
///
/// # Arguments
///
/// * `storage` - The storage backend to query
///
/// # Returns
///
/// * `Ok(StoreStatistics)` - Successfully loaded statistics
/// * `Err(WatchError)` - Failed to query statistics
pub fn load_statistics(storage: &dyn ListingStore) -> Result<StoreStatistics, WatchError> {
    Ok(StoreStatistics {
        active_listings: storage.count_listings(true)?,
        removed_listings: storage.count_listings(false)?,
        history_entries: storage.count_history_entries()?,
        recent_cycles: storage.get_recent_cycles(RECENT_CYCLES)?,
    })
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &StoreStatistics) {
    println!("=== Listing Store Statistics ===\n");

    println!("Overview:");
    println!("  Listings tracked: {}", stats.total_listings());
    println!("  Active: {}", stats.active_listings);
    println!("  Removed: {}", stats.removed_listings);
    println!("  History entries: {}", stats.history_entries);
    println!();

    if stats.recent_cycles.is_empty() {
        println!("No crawl cycles recorded yet");
        return;
    }

    println!("Recent Cycles ({}):", stats.recent_cycles.len());
    for cycle in &stats.recent_cycles {
        let counts = &cycle.counts;
        println!(
            "  #{} {} [{}] fetched {}, new {}, price {}, fields {}, removed {}, failures {}",
            cycle.id,
            cycle.started_at,
            cycle.status.to_db_string(),
            counts.fetched,
            counts.new,
            counts.price_changed,
            counts.fields_changed,
            counts.removed,
            counts.failures
        );
    }
}

/// Prints the summary of a finished cycle
pub fn print_cycle_report(report: &CycleReport) {
    let counts = &report.counts;
    println!("=== Cycle {} ===", report.cycle_id);
    if report.cancelled {
        println!("  (interrupted, removal sweep skipped)");
    }
    println!("  Duration: {:.1}s", report.elapsed.as_secs_f64());
    println!("  Fetched: {}", counts.fetched);
    println!(
        "  New: {}, price changes: {}, field changes: {}, unchanged: {}",
        counts.new, counts.price_changed, counts.fields_changed, counts.unchanged
    );
    println!("  Removed: {}", counts.removed);
    println!(
        "  Retries: {}, deferrals: {}",
        report.retries, report.deferrals
    );

    if !report.failures.is_empty() {
        println!("  Failures ({}):", report.failures.len());
        for failure in &report.failures {
            println!(
                "    - {} after {} attempt(s): {}",
                failure.url, failure.attempts, failure.reason
            );
        }
    }
}
