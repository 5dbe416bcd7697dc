//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::listing::CanonicalListing;
use crate::storage::{ChangeEvent, CycleCounts, CycleRecord, CycleStatus, HistoryEntry, ListingRecord};
use std::collections::HashSet;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Listing not found: {0}")]
    ListingNotFound(String),

    #[error("Cycle not found: {0}")]
    CycleNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid timestamp in database: {0}")]
    InvalidTimestamp(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for change-detection storage backends
///
/// Every method that writes is atomic per call: either all of its effects
/// are persisted or none are.
pub trait ListingStore {
    // ===== Change Detection =====

    /// Records one observation of a listing and classifies it
    ///
    /// # Arguments
    ///
    /// * `listing` - A sealed canonical listing
    ///
    /// # Returns
    ///
    /// The change event for this observation. Re-ingesting an identical
    /// observation yields `Unchanged` and writes no history.
    fn ingest(&mut self, listing: &CanonicalListing) -> StorageResult<ChangeEvent>;

    /// Ages every active listing not seen this cycle
    ///
    /// # Arguments
    ///
    /// * `seen_ids` - Source ids observed during the cycle
    /// * `grace_cycles` - Consecutive misses after which a listing is removed
    ///
    /// # Returns
    ///
    /// One `Removed` event per listing that reached the grace limit
    fn sweep(&mut self, seen_ids: &HashSet<String>, grace_cycles: u32)
        -> StorageResult<Vec<ChangeEvent>>;

    /// Gets a listing with its full history
    fn get_record(&self, source_id: &str) -> StorageResult<Option<ListingRecord>>;

    /// Gets the history of a listing, oldest first
    fn get_history(&self, source_id: &str) -> StorageResult<Vec<HistoryEntry>>;

    // ===== Cycle Management =====

    /// Creates a new crawl cycle and returns its ID
    fn create_cycle(&mut self, config_hash: &str) -> StorageResult<i64>;

    /// Marks a cycle finished with its status and tallies
    fn finish_cycle(
        &mut self,
        cycle_id: i64,
        status: CycleStatus,
        counts: &CycleCounts,
    ) -> StorageResult<()>;

    /// Gets a cycle by ID
    fn get_cycle(&self, cycle_id: i64) -> StorageResult<CycleRecord>;

    /// Gets the most recent cycles, newest first
    fn get_recent_cycles(&self, limit: u32) -> StorageResult<Vec<CycleRecord>>;

    // ===== Statistics =====

    /// Counts listings by whether they are still active
    fn count_listings(&self, active: bool) -> StorageResult<u64>;

    /// Counts all history entries
    fn count_history_entries(&self) -> StorageResult<u64>;
}
