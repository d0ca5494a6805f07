use http::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use http::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

/// Cache-conditional marker extracted from response headers and replayed as
/// `If-None-Match` / `If-Modified-Since` on the next request. At least one of
/// the two fields is always present.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    #[serde(rename = "ETag", skip_serializing_if = "Option::is_none", default)]
    etag: Option<String>,
    #[serde(
        rename = "LastModified",
        skip_serializing_if = "Option::is_none",
        default
    )]
    last_modified: Option<String>,
}

impl Validator {
    pub fn new(etag: Option<String>, last_modified: Option<String>) -> Option<Self> {
        if etag.is_none() && last_modified.is_none() {
            return None;
        }
        Some(Self {
            etag,
            last_modified,
        })
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let header_text = |name| {
            headers
                .get(name)
                .and_then(|value: &HeaderValue| value.to_str().ok())
                .map(ToOwned::to_owned)
        };
        Self::new(header_text(ETAG), header_text(LAST_MODIFIED))
    }

    /// Adds the conditional headers this validator stands for.
    pub fn apply(&self, headers: &mut HeaderMap) {
        if let Some(etag) = &self.etag {
            if let Ok(value) = HeaderValue::from_str(etag) {
                headers.insert(IF_NONE_MATCH, value);
            }
        }
        if let Some(last_modified) = &self.last_modified {
            if let Ok(value) = HeaderValue::from_str(last_modified) {
                headers.insert(IF_MODIFIED_SINCE, value);
            }
        }
    }

    /// Compact string form for persistence.
    pub fn to_string_form(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parses the string form; malformed input and the both-absent form both
    /// yield "no validator".
    pub fn parse(text: &str) -> Option<Self> {
        let parsed: Self = serde_json::from_str(text).ok()?;
        Self::new(parsed.etag, parsed.last_modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_etag_only() {
        let validator = Validator::new(Some("\"abc\"".to_owned()), None).expect("validator");
        let parsed = Validator::parse(&validator.to_string_form()).expect("parse");
        assert_eq!(parsed, validator);
    }

    #[test]
    fn round_trips_both_fields() {
        let validator = Validator::new(
            Some("\"v2\"".to_owned()),
            Some("Wed, 21 Oct 2015 07:28:00 GMT".to_owned()),
        )
        .expect("validator");
        let parsed = Validator::parse(&validator.to_string_form()).expect("parse");
        assert_eq!(parsed, validator);
    }

    #[test]
    fn both_absent_is_not_a_validator() {
        assert!(Validator::new(None, None).is_none());
        assert!(Validator::parse("{}").is_none());
        assert!(Validator::parse("not json").is_none());
    }

    #[test]
    fn applies_conditional_headers() {
        let validator = Validator::new(
            Some("\"abc\"".to_owned()),
            Some("Wed, 21 Oct 2015 07:28:00 GMT".to_owned()),
        )
        .expect("validator");
        let mut headers = HeaderMap::new();
        validator.apply(&mut headers);
        assert_eq!(
            headers.get(IF_NONE_MATCH).map(|value| value.as_bytes()),
            Some(b"\"abc\"".as_slice())
        );
        assert!(headers.contains_key(IF_MODIFIED_SINCE));
    }

    #[test]
    fn extracts_from_response_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_static("\"tag\""));
        let validator = Validator::from_headers(&headers).expect("validator");
        assert_eq!(validator.etag(), Some("\"tag\""));
        assert_eq!(validator.last_modified(), None);

        assert!(Validator::from_headers(&HeaderMap::new()).is_none());
    }
}
