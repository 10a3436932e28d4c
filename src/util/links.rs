use thiserror::Error;
use url::Url;

/// Query parameters that only carry campaign tracking and never identify content.
const TRACKING_PARAM_PREFIXES: &[&str] = &["utm_"];
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid"];

/// Errors returned when a configured source URL cannot be polled.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
}

/// Validates a URL string for use as a polled source.
///
/// Only `http` and `https` URLs with a host are accepted.
///
/// # Examples
///
/// ```
/// use forager::util::validate_source_url;
///
/// assert!(validate_source_url("https://example.com/feed.xml").is_ok());
/// assert!(validate_source_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_source_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlValidationError::MissingHost);
    }

    Ok(url)
}

/// Remove comment anchors (`#reply`, `#reply-123`, ...) that some feeds append
/// to item links, leaving any other fragment alone.
pub fn clean_link(link: &str) -> String {
    let link = link.trim();
    match link.find("#reply") {
        Some(idx) => link[..idx].to_owned(),
        None => link.to_owned(),
    }
}

/// Canonical form of an item link used for identity derivation.
///
/// Lowercases scheme and host, drops the fragment, default ports, tracking
/// query parameters and a trailing path slash. Strings that do not
/// parse as absolute URLs fall back to their trimmed form.
pub fn normalize_link(link: &str) -> String {
    let cleaned = clean_link(link);
    let Ok(mut url) = Url::parse(&cleaned) else {
        return cleaned;
    };

    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    // "https://host/blog/" and "https://host/blog" are the same resource
    let mut normalized = url.to_string();
    if url.query().is_none() && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    TRACKING_PARAMS.contains(&key.as_str())
        || TRACKING_PARAM_PREFIXES.iter().any(|p| key.starts_with(p))
}
