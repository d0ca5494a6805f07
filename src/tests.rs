use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, StatusCode, Uri};

use crate::util::{
    authority_key, charset_from_content_type, is_acceptable_status, is_redirect_status,
    is_tls_downgrade, resolve_redirect_uri, status_message,
};

#[test]
fn redirect_resolution_follows_relative_reference_rules() {
    let requested = Uri::from_static("http://a.test/x/y?q=1");
    assert_eq!(
        resolve_redirect_uri(&requested, "/z").expect("absolute path"),
        Uri::from_static("http://a.test/z")
    );
    assert_eq!(
        resolve_redirect_uri(&requested, "z2").expect("relative path"),
        Uri::from_static("http://a.test/x/z2")
    );
    assert_eq!(
        resolve_redirect_uri(&requested, "https://b.test/w").expect("absolute uri"),
        Uri::from_static("https://b.test/w")
    );
    assert_eq!(
        resolve_redirect_uri(&requested, "//c.test/p").expect("scheme-relative uri"),
        Uri::from_static("http://c.test/p")
    );
}

#[test]
fn redirect_statuses_are_the_four_handled_codes() {
    for code in [301_u16, 302, 303, 307] {
        let status = StatusCode::from_u16(code).expect("status");
        assert!(is_redirect_status(status), "{code} should redirect");
    }
    for code in [300_u16, 304, 308, 200] {
        let status = StatusCode::from_u16(code).expect("status");
        assert!(!is_redirect_status(status), "{code} should not redirect");
    }
}

#[test]
fn acceptable_status_range_covers_success_and_redirects() {
    assert!(is_acceptable_status(StatusCode::OK));
    assert!(is_acceptable_status(StatusCode::NO_CONTENT));
    assert!(is_acceptable_status(StatusCode::SEE_OTHER));
    assert!(is_acceptable_status(StatusCode::TEMPORARY_REDIRECT));
    assert!(!is_acceptable_status(StatusCode::USE_PROXY));
    assert!(!is_acceptable_status(StatusCode::NOT_FOUND));
    assert!(!is_acceptable_status(StatusCode::PERMANENT_REDIRECT));
}

#[test]
fn authority_key_normalizes_case_and_applies_default_ports() {
    assert_eq!(
        authority_key(&Uri::from_static("http://Host.Example/path")),
        Some("host.example:80".to_owned())
    );
    assert_eq!(
        authority_key(&Uri::from_static("https://host.example:8443/")),
        Some("host.example:8443".to_owned())
    );
    assert_eq!(authority_key(&Uri::from_static("/relative")), None);
}

#[test]
fn verified_https_to_http_is_a_downgrade() {
    let https = Uri::from_static("https://a.test/page");
    let http = Uri::from_static("http://a.test/page");
    let other_https = Uri::from_static("https://b.test/page");
    assert!(is_tls_downgrade(&https, true, &http));
    assert!(!is_tls_downgrade(&https, true, &other_https));
    // Unverified connections and plain-http origins may move freely.
    assert!(!is_tls_downgrade(&https, false, &http));
    assert!(!is_tls_downgrade(&http, true, &http));
}

#[test]
fn charset_parameter_is_extracted_case_insensitively() {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; Charset=\"ISO-8859-1\""),
    );
    assert_eq!(
        charset_from_content_type(&headers),
        Some("iso-8859-1".to_owned())
    );

    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    assert_eq!(charset_from_content_type(&headers), None);
}

#[test]
fn long_stock_reason_phrases_are_shortened() {
    assert_eq!(
        status_message(StatusCode::INTERNAL_SERVER_ERROR),
        "Internal Error"
    );
    assert_eq!(
        status_message(StatusCode::SERVICE_UNAVAILABLE),
        "Service Unavailable"
    );
    assert_eq!(status_message(StatusCode::NOT_FOUND), "Not Found");
    let unassigned = StatusCode::from_u16(599).expect("status");
    assert_eq!(status_message(unassigned), "HTTP 599");
}
