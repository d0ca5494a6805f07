use std::sync::Mutex;

use http::header::{CONTENT_TYPE, LOCATION};
use http::{HeaderMap, StatusCode, Uri};

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn is_redirect_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
    )
}

/// Statuses accepted when a request demands success: 2xx, the handled
/// redirect range, and 307.
pub(crate) fn is_acceptable_status(status: StatusCode) -> bool {
    let code = status.as_u16();
    (200..=303).contains(&code) || code == 307
}

pub(crate) fn redirect_location(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
}

/// RFC 3986 relative resolution of a `Location` value against the current
/// request target.
pub(crate) fn resolve_redirect_uri(current_uri: &Uri, location: &str) -> Option<Uri> {
    let base = url::Url::parse(&current_uri.to_string()).ok()?;
    let joined = base.join(location).ok()?;
    joined.as_str().parse().ok()
}

/// A redirect is a downgrade when the current connection is verified HTTPS
/// and the target is not HTTPS.
pub(crate) fn is_tls_downgrade(current: &Uri, verify_tls: bool, target: &Uri) -> bool {
    verify_tls && current.scheme_str() == Some("https") && target.scheme_str() != Some("https")
}

pub(crate) fn default_port(uri: &Uri) -> Option<u16> {
    uri.port_u16().or_else(|| match uri.scheme_str() {
        Some("https") => Some(443),
        Some("http") => Some(80),
        _ => None,
    })
}

/// `host:port` key used for inter-request delay spacing.
pub(crate) fn authority_key(uri: &Uri) -> Option<String> {
    let host = uri.host()?.to_ascii_lowercase();
    let Some(port) = default_port(uri) else {
        return Some(host);
    };
    Some(format!("{host}:{port}"))
}

/// Canonical reason phrase for a status, with the overly long stock phrases
/// shortened for display.
pub(crate) fn status_message(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some("Internal Server Error") => "Internal Error".to_owned(),
        Some("Service Temporarily Unavailable") | Some("Service Unavailable") => {
            "Service Unavailable".to_owned()
        }
        Some(reason) => reason.to_owned(),
        None => format!("HTTP {}", status.as_u16()),
    }
}

/// Extracts the `charset=` parameter from a `Content-Type` header value.
pub(crate) fn charset_from_content_type(headers: &HeaderMap) -> Option<String> {
    let content_type = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    for parameter in content_type.split(';').skip(1) {
        let parameter = parameter.trim();
        if let Some((name, value)) = parameter.split_once('=') {
            if name.trim().eq_ignore_ascii_case("charset") {
                let value = value.trim().trim_matches('"');
                if !value.is_empty() {
                    return Some(value.to_ascii_lowercase());
                }
            }
        }
    }
    None
}

pub(crate) fn is_gzip_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("gzip"))
}
