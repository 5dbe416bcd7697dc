//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the ListingStore trait.

use crate::listing::CanonicalListing;
use crate::storage::change::{classify, Classification, StoredState};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{ListingStore, StorageError, StorageResult};
use crate::storage::{
    ChangeEvent, CycleCounts, CycleRecord, CycleStatus, HistoryEntry, ListingRecord,
};
use crate::WatchError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(WatchError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, WatchError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self, WatchError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

// Fixed-width timestamps keep lexical and chronological order identical
fn to_db_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_db_time(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp(raw.to_string()))
}

fn load_stored_state(conn: &Connection, source_id: &str) -> StorageResult<Option<StoredState>> {
    let row: Option<(String, i64, String, bool, String)> = conn
        .query_row(
            "SELECT current_fingerprint, current_price, last_seen_at, active, snapshot
             FROM listings WHERE source_id = ?1",
            params![source_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .optional()?;

    let Some((current_fingerprint, current_price, last_seen_at, active, snapshot)) = row else {
        return Ok(None);
    };

    Ok(Some(StoredState {
        current_fingerprint,
        current_price,
        last_seen_at: from_db_time(&last_seen_at)?,
        active,
        snapshot: serde_json::from_str(&snapshot)?,
    }))
}

fn load_history(conn: &Connection, source_id: &str) -> StorageResult<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT price, fingerprint, observed_at FROM listing_history
         WHERE source_id = ?1 ORDER BY observed_at, id",
    )?;

    let rows = stmt.query_map(params![source_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut history = Vec::new();
    for row in rows {
        let (price, fingerprint, observed_at) = row?;
        history.push(HistoryEntry {
            price,
            fingerprint,
            observed_at: from_db_time(&observed_at)?,
        });
    }
    Ok(history)
}

fn load_record(conn: &Connection, source_id: &str) -> StorageResult<Option<ListingRecord>> {
    let row: Option<(String, i64, String, String, String, u32, bool)> = conn
        .query_row(
            "SELECT current_fingerprint, current_price, currency, first_seen_at, last_seen_at,
             missed_cycles, active
             FROM listings WHERE source_id = ?1",
            params![source_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            },
        )
        .optional()?;

    let Some((current_fingerprint, current_price, currency, first_seen, last_seen, missed, active)) =
        row
    else {
        return Ok(None);
    };

    Ok(Some(ListingRecord {
        source_id: source_id.to_string(),
        current_fingerprint,
        current_price,
        currency,
        first_seen_at: from_db_time(&first_seen)?,
        last_seen_at: from_db_time(&last_seen)?,
        missed_cycles: missed,
        active,
        history: load_history(conn, source_id)?,
    }))
}

fn cycle_from_row(row: &Row<'_>) -> rusqlite::Result<(CycleRecord, String)> {
    let status: String = row.get(4)?;
    let count = |idx: usize| row.get::<_, i64>(idx).map(|n| n.max(0) as u64);

    let record = CycleRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        config_hash: row.get(3)?,
        status: CycleStatus::Running,
        counts: CycleCounts {
            fetched: count(5)?,
            new: count(6)?,
            price_changed: count(7)?,
            fields_changed: count(8)?,
            unchanged: count(9)?,
            removed: count(10)?,
            failures: count(11)?,
        },
    };
    Ok((record, status))
}

fn with_status((mut record, status): (CycleRecord, String)) -> CycleRecord {
    record.status = CycleStatus::from_db_string(&status).unwrap_or(CycleStatus::Failed);
    record
}

const CYCLE_COLUMNS: &str = "id, started_at, finished_at, config_hash, status, fetched, \
     new_listings, price_changes, field_changes, unchanged, removed, failures";

impl ListingStore for SqliteStorage {
    // ===== Change Detection =====

    fn ingest(&mut self, listing: &CanonicalListing) -> StorageResult<ChangeEvent> {
        let tx = self.conn.transaction()?;

        let fingerprint = listing.fingerprint();
        let stored = load_stored_state(&tx, &listing.source_id)?;
        let classification = classify(stored.as_ref(), listing, &fingerprint);
        let observed_at = to_db_time(&listing.observed_at);

        match &classification {
            Classification::Stale => {
                tracing::debug!(
                    source_id = %listing.source_id,
                    observed_at = %observed_at,
                    "Ignoring stale observation"
                );
            }
            Classification::Unchanged => {
                tx.execute(
                    "UPDATE listings SET last_seen_at = ?1, missed_cycles = 0 WHERE source_id = ?2",
                    params![observed_at, listing.source_id],
                )?;
            }
            Classification::New => {
                tx.execute(
                    "INSERT INTO listings (source_id, current_fingerprint, current_price, currency,
                     snapshot, first_seen_at, last_seen_at, missed_cycles, active)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0, 1)",
                    params![
                        listing.source_id,
                        fingerprint,
                        listing.price,
                        listing.currency,
                        serde_json::to_string(listing)?,
                        observed_at,
                    ],
                )?;
            }
            Classification::Reactivated
            | Classification::PriceChanged { .. }
            | Classification::FieldsChanged { .. } => {
                tx.execute(
                    "UPDATE listings SET current_fingerprint = ?1, current_price = ?2, currency = ?3,
                     snapshot = ?4, last_seen_at = ?5, missed_cycles = 0, active = 1
                     WHERE source_id = ?6",
                    params![
                        fingerprint,
                        listing.price,
                        listing.currency,
                        serde_json::to_string(listing)?,
                        observed_at,
                        listing.source_id,
                    ],
                )?;
            }
        }

        if classification.appends_history() {
            tx.execute(
                "INSERT INTO listing_history (source_id, price, fingerprint, observed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    listing.source_id,
                    listing.price,
                    fingerprint,
                    observed_at
                ],
            )?;
        }

        let source_id = listing.source_id.clone();
        let event = match classification {
            Classification::Stale | Classification::Unchanged => {
                ChangeEvent::Unchanged { source_id }
            }
            other => {
                let record = load_record(&tx, &source_id)?
                    .ok_or_else(|| StorageError::ListingNotFound(source_id.clone()))?;
                match other {
                    Classification::PriceChanged { old_price } => ChangeEvent::PriceChanged {
                        old_price,
                        new_price: listing.price,
                        record,
                    },
                    Classification::FieldsChanged { diff } => {
                        ChangeEvent::FieldsChanged { diff, record }
                    }
                    _ => ChangeEvent::New(record),
                }
            }
        };

        tx.commit()?;
        Ok(event)
    }

    fn sweep(
        &mut self,
        seen_ids: &HashSet<String>,
        grace_cycles: u32,
    ) -> StorageResult<Vec<ChangeEvent>> {
        let tx = self.conn.transaction()?;

        let active: Vec<(String, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT source_id, missed_cycles FROM listings WHERE active = 1 ORDER BY source_id",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut removed = Vec::new();
        for (source_id, missed) in active {
            if seen_ids.contains(&source_id) {
                if missed > 0 {
                    tx.execute(
                        "UPDATE listings SET missed_cycles = 0 WHERE source_id = ?1",
                        params![source_id],
                    )?;
                }
                continue;
            }

            let missed = missed + 1;
            if missed >= grace_cycles {
                tx.execute(
                    "UPDATE listings SET missed_cycles = ?1, active = 0 WHERE source_id = ?2",
                    params![missed, source_id],
                )?;
                removed.push(ChangeEvent::Removed { source_id });
            } else {
                tx.execute(
                    "UPDATE listings SET missed_cycles = ?1 WHERE source_id = ?2",
                    params![missed, source_id],
                )?;
            }
        }

        tx.commit()?;
        Ok(removed)
    }

    fn get_record(&self, source_id: &str) -> StorageResult<Option<ListingRecord>> {
        load_record(&self.conn, source_id)
    }

    fn get_history(&self, source_id: &str) -> StorageResult<Vec<HistoryEntry>> {
        load_history(&self.conn, source_id)
    }

    // ===== Cycle Management =====

    fn create_cycle(&mut self, config_hash: &str) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO cycles (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
            params![now, config_hash, CycleStatus::Running.to_db_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn finish_cycle(
        &mut self,
        cycle_id: i64,
        status: CycleStatus,
        counts: &CycleCounts,
    ) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn.execute(
            "UPDATE cycles SET status = ?1, finished_at = ?2, fetched = ?3, new_listings = ?4,
             price_changes = ?5, field_changes = ?6, unchanged = ?7, removed = ?8, failures = ?9
             WHERE id = ?10",
            params![
                status.to_db_string(),
                now,
                counts.fetched as i64,
                counts.new as i64,
                counts.price_changed as i64,
                counts.fields_changed as i64,
                counts.unchanged as i64,
                counts.removed as i64,
                counts.failures as i64,
                cycle_id
            ],
        )?;

        if updated == 0 {
            return Err(StorageError::CycleNotFound(cycle_id));
        }
        Ok(())
    }

    fn get_cycle(&self, cycle_id: i64) -> StorageResult<CycleRecord> {
        let sql = format!("SELECT {} FROM cycles WHERE id = ?1", CYCLE_COLUMNS);
        self.conn
            .query_row(&sql, params![cycle_id], cycle_from_row)
            .optional()?
            .map(with_status)
            .ok_or(StorageError::CycleNotFound(cycle_id))
    }

    fn get_recent_cycles(&self, limit: u32) -> StorageResult<Vec<CycleRecord>> {
        let sql = format!(
            "SELECT {} FROM cycles ORDER BY id DESC LIMIT ?1",
            CYCLE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit], cycle_from_row)?;

        let mut cycles = Vec::new();
        for row in rows {
            cycles.push(with_status(row?));
        }
        Ok(cycles)
    }

    // ===== Statistics =====

    fn count_listings(&self, active: bool) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM listings WHERE active = ?1",
            params![active],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn count_history_entries(&self) -> StorageResult<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM listing_history", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
