//! Storage module for change detection
//!
//! This module persists what has been observed about each listing and decides,
//! exactly once per observed state change, what kind of change happened:
//! - SQLite database initialization and schema management
//! - Per-listing current state plus an append-only price/fingerprint history
//! - Classification of each ingest as new, price change, field change or unchanged
//! - Removal sweeps with a grace period of missed crawl cycles
//! - Crawl cycle bookkeeping

mod change;
mod schema;
mod sqlite;
mod traits;

pub use change::{classify, diff_fields, Classification, StoredState};
pub use sqlite::SqliteStorage;
pub use traits::{ListingStore, StorageError, StorageResult};

use crate::WatchError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

/// Initializes or opens a storage database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteStorage)` - Successfully initialized storage
/// * `Err(WatchError)` - Failed to initialize storage
pub fn open_storage(path: &Path) -> Result<SqliteStorage, WatchError> {
    SqliteStorage::new(path)
}

/// One immutable entry of a listing's history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub price: i64,
    pub fingerprint: String,
    pub observed_at: DateTime<Utc>,
}

/// Stored state of a listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingRecord {
    pub source_id: String,
    pub current_fingerprint: String,
    pub current_price: i64,
    pub currency: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,

    /// Consecutive crawl cycles in which the listing was not seen
    pub missed_cycles: u32,

    /// False once the listing has been reported removed
    pub active: bool,

    /// Every recorded state, oldest first
    pub history: Vec<HistoryEntry>,
}

/// A single changed field between two observations
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub old: String,
    pub new: String,
}

/// What an ingest or sweep decided about a listing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// First observation, or reappearance of a removed listing
    New(ListingRecord),

    PriceChanged {
        old_price: i64,
        new_price: i64,
        record: ListingRecord,
    },

    /// Fingerprint changed while the price stayed the same
    FieldsChanged {
        diff: Vec<FieldChange>,
        record: ListingRecord,
    },

    Unchanged { source_id: String },

    /// Not seen for the configured number of consecutive cycles
    Removed { source_id: String },
}

impl ChangeEvent {
    pub fn source_id(&self) -> &str {
        match self {
            Self::New(record) => &record.source_id,
            Self::PriceChanged { record, .. } | Self::FieldsChanged { record, .. } => {
                &record.source_id
            }
            Self::Unchanged { source_id } | Self::Removed { source_id } => source_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::New(_) => "new",
            Self::PriceChanged { .. } => "price_changed",
            Self::FieldsChanged { .. } => "fields_changed",
            Self::Unchanged { .. } => "unchanged",
            Self::Removed { .. } => "removed",
        }
    }
}

/// Per-cycle tallies of fetches and emitted events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleCounts {
    pub fetched: u64,
    pub new: u64,
    pub price_changed: u64,
    pub fields_changed: u64,
    pub unchanged: u64,
    pub removed: u64,
    pub failures: u64,
}

impl CycleCounts {
    /// Counts one emitted event
    pub fn record(&mut self, event: &ChangeEvent) {
        match event {
            ChangeEvent::New(_) => self.new += 1,
            ChangeEvent::PriceChanged { .. } => self.price_changed += 1,
            ChangeEvent::FieldsChanged { .. } => self.fields_changed += 1,
            ChangeEvent::Unchanged { .. } => self.unchanged += 1,
            ChangeEvent::Removed { .. } => self.removed += 1,
        }
    }
}

/// Represents a crawl cycle
#[derive(Debug, Clone)]
pub struct CycleRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: CycleStatus,
    pub counts: CycleCounts,
}

/// Status of a crawl cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl CycleStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_status_roundtrip() {
        for status in &[
            CycleStatus::Running,
            CycleStatus::Completed,
            CycleStatus::Interrupted,
            CycleStatus::Failed,
        ] {
            let db_str = status.to_db_string();
            let parsed = CycleStatus::from_db_string(db_str);
            assert_eq!(Some(*status), parsed);
        }
    }

    #[test]
    fn test_cycle_status_invalid() {
        assert_eq!(CycleStatus::from_db_string("invalid"), None);
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let event = ChangeEvent::Removed {
            source_id: "42".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "removed");
        assert_eq!(json["source_id"], "42");
        assert_eq!(event.kind(), "removed");
        assert_eq!(event.source_id(), "42");
    }

    #[test]
    fn test_cycle_counts_record() {
        let mut counts = CycleCounts::default();
        counts.record(&ChangeEvent::Unchanged {
            source_id: "1".to_string(),
        });
        counts.record(&ChangeEvent::Removed {
            source_id: "2".to_string(),
        });
        assert_eq!(counts.unchanged, 1);
        assert_eq!(counts.removed, 1);
        assert_eq!(counts.new, 0);
    }
}
