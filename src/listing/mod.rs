//! Canonical listing model and payload normalization
//!
//! Every fetched listing page is reduced to a `CanonicalListing` before it
//! reaches the change-detection store. The listing's fingerprint covers the
//! listing content but not where or when it was observed, so re-observing an
//! unchanged listing always produces the same fingerprint.

mod normalizer;

pub use normalizer::{normalize, ParseFailure, RawPage};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Where a listing is located
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub district: Option<String>,
    pub metro_station: Option<String>,
    pub metro_distance_minutes: Option<u32>,
}

/// A listing reduced to the fields change detection cares about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalListing {
    /// Marketplace identifier of the listing
    pub source_id: String,

    /// Normalized listing URL
    pub url: String,

    /// Asking price in whole currency units
    pub price: i64,

    /// ISO currency code
    pub currency: String,

    /// Total area in square meters
    pub area: Option<f64>,

    pub rooms: Option<u32>,
    pub floor: Option<i32>,
    pub floor_total: Option<u32>,

    pub location: Location,

    /// Amenity tags, lowercased and ordered
    pub amenities: BTreeSet<String>,

    /// Hex SHA-256 over the canonical fields, see [`CanonicalListing::fingerprint`]
    pub raw_fingerprint: String,

    /// When the listing was fetched
    pub observed_at: DateTime<Utc>,
}

/// The fingerprinted view of a listing: everything but the URL, the
/// observation time and the stored fingerprint itself
#[derive(Serialize)]
struct FingerprintView<'a> {
    source_id: &'a str,
    price: i64,
    currency: &'a str,
    area: Option<f64>,
    rooms: Option<u32>,
    floor: Option<i32>,
    floor_total: Option<u32>,
    location: &'a Location,
    amenities: &'a BTreeSet<String>,
}

impl CanonicalListing {
    /// Computes the content fingerprint of this listing
    ///
    /// Two listings that differ only in `observed_at` or `url` have the same
    /// fingerprint. The same listing is reachable under several URLs (tracking
    /// parameters, regional subdomains).
    pub fn fingerprint(&self) -> String {
        let view = FingerprintView {
            source_id: &self.source_id,
            price: self.price,
            currency: &self.currency,
            area: self.area,
            rooms: self.rooms,
            floor: self.floor,
            floor_total: self.floor_total,
            location: &self.location,
            amenities: &self.amenities,
        };

        // Serializing plain structs and ordered sets cannot fail
        let canonical = serde_json::to_vec(&view).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    /// Stores the computed fingerprint in `raw_fingerprint`
    pub fn sealed(mut self) -> Self {
        self.raw_fingerprint = self.fingerprint();
        self
    }
}
