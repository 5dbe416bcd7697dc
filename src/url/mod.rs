//! URL handling module for Listing-Watch
//!
//! This module provides listing URL normalization, host extraction, host
//! pattern matching for configured targets, and derivation of the listing key
//! used to keep at most one fetch per listing in flight.

mod normalize;

pub use normalize::normalize_url;

use url::Url;

/// Extracts the lowercase host from a URL, without a leading `www.`
pub fn extract_host(url: &Url) -> Option<String> {
    url.host_str().map(|h| {
        let host = h.to_lowercase();
        match host.strip_prefix("www.") {
            Some(bare) => bare.to_string(),
            None => host,
        }
    })
}

/// Checks if a host matches a target pattern
///
/// `"cian.ru"` matches only `cian.ru`; `"*.cian.ru"` matches `cian.ru` and
/// any subdomain such as `spb.cian.ru`.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(base) => host == base || host.ends_with(&format!(".{}", base)),
        None => host == pattern,
    }
}

/// Numeric listing id carried by a URL, if any
///
/// Listing pages carry their id as the last all-digit path segment
/// (`/sale/flat/301234567/`).
pub fn listing_id(url: &Url) -> Option<String> {
    url.path_segments().and_then(|segments| {
        segments
            .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
            .last()
            .map(str::to_string)
    })
}

/// Derives the listing key for a URL
///
/// This is the listing id when the URL has one. Otherwise the normalized URL
/// itself is the key, so two different index pages never collide.
pub fn listing_key(url: &Url) -> String {
    listing_id(url).unwrap_or_else(|| url.as_str().to_string())
}
