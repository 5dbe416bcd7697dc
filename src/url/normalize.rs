use crate::UrlError;
use url::Url;

/// Query parameters that identify a visit rather than a listing
const SESSION_PARAMS: &[&str] = &[
    "fbclid",
    "gclid",
    "yclid",
    "from",
    "context",
    "mlsearchsessionguid",
    "_openstat",
];

/// Normalizes a listing URL so that the same listing always maps to the same task
///
/// # Normalization Steps
///
/// 1. Parse the URL; reject if malformed or not HTTP(S)
/// 2. Lowercase the host and drop a `www.` prefix
/// 3. Collapse duplicate slashes and dot segments, keeping a trailing slash
/// 4. Remove the fragment
/// 5. Remove `utm_*` and session/referral parameters, sort the rest
///
/// # Examples
///
/// ```
/// use listing_watch::url::normalize_url;
///
/// let url = normalize_url("https://WWW.CIAN.RU/sale/flat/42/?utm_source=tg#photos").unwrap();
/// assert_eq!(url.as_str(), "https://cian.ru/sale/flat/42/");
/// ```
pub fn normalize_url(url_str: &str) -> Result<Url, UrlError> {
    let mut url = Url::parse(url_str.trim()).map_err(|e| UrlError::Parse(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(url.scheme().to_string()));
    }

    let host = url
        .host_str()
        .map(|h| h.to_lowercase())
        .ok_or(UrlError::MissingHost)?;
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    url.set_host(Some(&host))
        .map_err(|e| UrlError::Malformed(format!("Failed to set host: {}", e)))?;

    let path = collapse_path(url.path());
    url.set_path(&path);
    url.set_fragment(None);

    if url.query().is_some() {
        let mut params: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| !is_session_param(key))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        params.sort();

        if params.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(params);
        }
    }

    Ok(url)
}

fn collapse_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return "/".to_string();
    }

    let mut collapsed = format!("/{}", segments.join("/"));
    if path.ends_with('/') {
        collapsed.push('/');
    }
    collapsed
}

fn is_session_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || SESSION_PARAMS.contains(&key.as_str())
}
