//! Change classification
//!
//! Pure decision logic shared by storage backends: given what is stored for a
//! listing and a fresh observation, decide which kind of change happened.

use crate::listing::CanonicalListing;
use crate::storage::FieldChange;
use chrono::{DateTime, Utc};

/// The stored projection of a listing needed to classify an observation
#[derive(Debug, Clone)]
pub struct StoredState {
    pub current_fingerprint: String,
    pub current_price: i64,
    pub last_seen_at: DateTime<Utc>,
    pub active: bool,

    /// The last observation that changed the fingerprint
    pub snapshot: CanonicalListing,
}

/// Outcome of comparing an observation with stored state
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Never seen before
    New,

    /// Previously reported removed and now observed again
    Reactivated,

    /// Older than the last recorded observation; nothing is written
    Stale,

    Unchanged,

    PriceChanged { old_price: i64 },

    FieldsChanged { diff: Vec<FieldChange> },
}

impl Classification {
    /// Whether this observation appends a history entry
    pub fn appends_history(&self) -> bool {
        !matches!(self, Self::Stale | Self::Unchanged)
    }
}

/// Classifies an observation against the stored state of its listing
///
/// `fingerprint` is the content fingerprint computed from `listing`; the
/// listing's own `raw_fingerprint` is not trusted.
pub fn classify(
    stored: Option<&StoredState>,
    listing: &CanonicalListing,
    fingerprint: &str,
) -> Classification {
    let Some(stored) = stored else {
        return Classification::New;
    };

    if listing.observed_at < stored.last_seen_at {
        return Classification::Stale;
    }

    if !stored.active {
        return Classification::Reactivated;
    }

    if fingerprint == stored.current_fingerprint {
        return Classification::Unchanged;
    }

    if listing.price != stored.current_price {
        Classification::PriceChanged {
            old_price: stored.current_price,
        }
    } else {
        Classification::FieldsChanged {
            diff: diff_fields(&stored.snapshot, listing),
        }
    }
}

/// Lists the canonical fields that differ between two observations
///
/// Values are rendered as strings; an absent optional field renders empty.
pub fn diff_fields(old: &CanonicalListing, new: &CanonicalListing) -> Vec<FieldChange> {
    let old_fields = field_values(old);
    let new_fields = field_values(new);

    old_fields
        .into_iter()
        .zip(new_fields)
        .filter(|((_, before), (_, after))| before != after)
        .map(|((field, before), (_, after))| FieldChange {
            field: field.to_string(),
            old: before,
            new: after,
        })
        .collect()
}

fn field_values(listing: &CanonicalListing) -> [(&'static str, String); 10] {
    fn opt<T: ToString>(value: &Option<T>) -> String {
        value.as_ref().map(ToString::to_string).unwrap_or_default()
    }

    [
        ("price", listing.price.to_string()),
        ("currency", listing.currency.clone()),
        ("area", opt(&listing.area)),
        ("rooms", opt(&listing.rooms)),
        ("floor", opt(&listing.floor)),
        ("floor_total", opt(&listing.floor_total)),
        ("district", opt(&listing.location.district)),
        ("metro_station", opt(&listing.location.metro_station)),
        (
            "metro_distance_minutes",
            opt(&listing.location.metro_distance_minutes),
        ),
        (
            "amenities",
            listing
                .amenities
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(","),
        ),
    ]
}
