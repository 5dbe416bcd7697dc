//! Listing normalizer
//!
//! Converts a fetched payload into a `CanonicalListing`. Two payload shapes
//! are understood:
//! - A JSON document, as returned by the marketplace's API endpoints
//! - An HTML page embedding its state as a `<script type="application/ld+json">`
//!   or `<script type="application/json">` block
//!
//! Field names vary between page generations, so every field is looked up
//! through a list of JSON pointers and the first usable value wins.

use super::{CanonicalListing, Location};
use crate::url::listing_id;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use thiserror::Error;
use url::Url;

/// Currency assumed when the payload does not name one
const DEFAULT_CURRENCY: &str = "RUB";

/// How deep the search for the listing object descends into a document
const MAX_SEARCH_DEPTH: usize = 5;

const SOURCE_ID_PATHS: &[&str] = &["/cianId", "/offerId", "/id", "/sku", "/productID", "/identifier"];
const PRICE_PATHS: &[&str] = &[
    "/price",
    "/priceRur",
    "/bargainTerms/priceRur",
    "/bargainTerms/price",
    "/offers/price",
    "/offers/0/price",
];
const CURRENCY_PATHS: &[&str] = &[
    "/currency",
    "/bargainTerms/currency",
    "/priceCurrency",
    "/offers/priceCurrency",
    "/offers/0/priceCurrency",
];
const AREA_PATHS: &[&str] = &["/totalArea", "/area", "/floorSize/value"];
const ROOMS_PATHS: &[&str] = &["/roomsCount", "/rooms", "/numberOfRooms"];
const FLOOR_PATHS: &[&str] = &["/floorNumber", "/floor"];
const FLOOR_TOTAL_PATHS: &[&str] = &["/building/floorsCount", "/floorsCount", "/floorTotal"];
const DISTRICT_PATHS: &[&str] = &["/geo/districts/0/name", "/geo/district", "/district"];
const METRO_PATHS: &[&str] = &[
    "/geo/undergrounds/0/name",
    "/undergrounds/0/name",
    "/metro/name",
    "/metroStation",
];
const METRO_TIME_PATHS: &[&str] = &[
    "/geo/undergrounds/0/time",
    "/undergrounds/0/time",
    "/metro/time",
    "/metroDistanceMinutes",
];
const AMENITY_LIST_PATHS: &[&str] = &["/amenities", "/features"];

/// Boolean payload flags that map onto amenity tags
const AMENITY_FLAGS: &[(&str, &str)] = &[
    ("/hasFurniture", "furniture"),
    ("/hasInternet", "internet"),
    ("/hasParking", "parking"),
    ("/hasRamp", "ramp"),
    ("/building/hasElevator", "elevator"),
];

/// Why a payload could not be turned into a listing
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("empty response body")]
    EmptyBody,

    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("page has no embedded listing state")]
    NoStateBlock,

    #[error("listing is missing required field `{0}`")]
    MissingField(&'static str),
}

/// A fetched payload waiting to be normalized
#[derive(Debug, Clone)]
pub struct RawPage {
    /// Normalized URL the payload belongs to
    pub url: Url,

    /// Response body
    pub body: String,

    /// When the payload was fetched
    pub observed_at: DateTime<Utc>,
}

/// Normalizes a raw payload into a canonical listing
///
/// # Arguments
///
/// * `page` - The fetched payload and the URL it came from
///
/// # Returns
///
/// * `Ok(CanonicalListing)` - A sealed listing with its fingerprint computed
/// * `Err(ParseFailure)` - The payload is not a recognizable listing
///
/// A payload without an id falls back to the numeric id in the URL. A
/// listing without a price is rejected.
pub fn normalize(page: &RawPage) -> Result<CanonicalListing, ParseFailure> {
    let body = page.body.trim();
    if body.is_empty() {
        return Err(ParseFailure::EmptyBody);
    }

    let documents = if body.starts_with('{') || body.starts_with('[') {
        vec![serde_json::from_str::<Value>(body)
            .map_err(|e| ParseFailure::InvalidJson(e.to_string()))?]
    } else {
        extract_state_blocks(body)?
    };

    let offer = documents
        .iter()
        .find_map(locate_offer)
        .ok_or(ParseFailure::MissingField("price"))?;

    build_listing(offer, page)
}

/// Collects every parseable JSON state block from an HTML page
fn extract_state_blocks(html: &str) -> Result<Vec<Value>, ParseFailure> {
    let document = Html::parse_document(html);
    let mut blocks = Vec::new();

    for selector in [
        r#"script[type="application/ld+json"]"#,
        r#"script[type="application/json"]"#,
    ] {
        let Ok(selector) = Selector::parse(selector) else {
            continue;
        };
        for element in document.select(&selector) {
            let text = element.text().collect::<String>();
            match serde_json::from_str::<Value>(text.trim()) {
                Ok(value) => blocks.push(value),
                Err(e) => tracing::trace!(error = %e, "Skipping unparseable state block"),
            }
        }
    }

    if blocks.is_empty() {
        Err(ParseFailure::NoStateBlock)
    } else {
        Ok(blocks)
    }
}

/// Finds the shallowest object in a document that carries a usable price
fn locate_offer(document: &Value) -> Option<&Value> {
    let mut queue = VecDeque::from([(document, 0usize)]);

    while let Some((value, depth)) = queue.pop_front() {
        if value.is_object() && first_of(value, PRICE_PATHS, as_price).is_some() {
            return Some(value);
        }
        if depth >= MAX_SEARCH_DEPTH {
            continue;
        }
        match value {
            Value::Object(map) => queue.extend(map.values().map(|v| (v, depth + 1))),
            Value::Array(items) => queue.extend(items.iter().map(|v| (v, depth + 1))),
            _ => {}
        }
    }

    None
}

fn build_listing(offer: &Value, page: &RawPage) -> Result<CanonicalListing, ParseFailure> {
    let source_id = first_of(offer, SOURCE_ID_PATHS, as_text)
        .or_else(|| listing_id(&page.url))
        .ok_or(ParseFailure::MissingField("source_id"))?;

    let price = first_of(offer, PRICE_PATHS, as_price).ok_or(ParseFailure::MissingField("price"))?;

    let currency = first_of(offer, CURRENCY_PATHS, as_text)
        .map(|c| canonical_currency(&c))
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    let location = Location {
        district: first_of(offer, DISTRICT_PATHS, as_text),
        metro_station: first_of(offer, METRO_PATHS, as_text),
        metro_distance_minutes: first_of(offer, METRO_TIME_PATHS, as_u32),
    };

    let listing = CanonicalListing {
        source_id,
        url: page.url.to_string(),
        price,
        currency,
        area: first_of(offer, AREA_PATHS, as_f64),
        rooms: first_of(offer, ROOMS_PATHS, as_u32),
        floor: first_of(offer, FLOOR_PATHS, as_i64).and_then(|f| i32::try_from(f).ok()),
        floor_total: first_of(offer, FLOOR_TOTAL_PATHS, as_u32),
        location,
        amenities: collect_amenities(offer),
        raw_fingerprint: String::new(),
        observed_at: page.observed_at,
    };

    Ok(listing.sealed())
}

fn collect_amenities(offer: &Value) -> BTreeSet<String> {
    let mut amenities = BTreeSet::new();

    for path in AMENITY_LIST_PATHS {
        if let Some(Value::Array(items)) = offer.pointer(path) {
            amenities.extend(
                items
                    .iter()
                    .filter_map(as_text)
                    .map(|tag| tag.trim().to_lowercase())
                    .filter(|tag| !tag.is_empty()),
            );
        }
    }

    for (path, tag) in AMENITY_FLAGS {
        if offer.pointer(path).and_then(Value::as_bool) == Some(true) {
            amenities.insert(tag.to_string());
        }
    }

    amenities
}

/// Applies `convert` to each pointer in turn and returns the first success
fn first_of<T>(value: &Value, paths: &[&str], convert: fn(&Value) -> Option<T>) -> Option<T> {
    paths
        .iter()
        .filter_map(|path| value.pointer(path))
        .find_map(convert)
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_u32(value: &Value) -> Option<u32> {
    as_i64(value).and_then(|n| u32::try_from(n).ok())
}

/// Reads a price, tolerating display strings such as "12 500 000 ₽"
fn as_price(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => parse_price_text(s),
        other => as_i64(other).filter(|p| *p >= 0),
    }
}

/// Parses a displayed price into whole units, rounding kopecks half up
///
/// A trailing `.` or `,` followed by one or two digits separates the
/// fraction; any other `.` or `,` groups thousands. Negative prices are
/// rejected.
fn parse_price_text(text: &str) -> Option<i64> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let number = compact.trim_matches(|c: char| !c.is_ascii_digit() && c != '-');
    if number.starts_with('-') {
        return None;
    }

    let (whole, fraction) = match number.rfind(['.', ',']) {
        Some(at) if (1..=2).contains(&(number.len() - at - 1)) => {
            (&number[..at], &number[at + 1..])
        }
        _ => (number, ""),
    };
    let digits: String = whole.chars().filter(|c| !matches!(c, '.' | ',')).collect();
    if digits.is_empty()
        || !digits.chars().all(|c| c.is_ascii_digit())
        || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }

    let units: i64 = digits.parse().ok()?;
    let kopecks: u32 = format!("{:0<2}", fraction).parse().ok()?;
    units.checked_add(i64::from(kopecks >= 50))
}

fn canonical_currency(raw: &str) -> String {
    match raw.trim().to_uppercase().as_str() {
        "RUR" | "₽" => "RUB".to_string(),
        other => other.to_string(),
    }
}
