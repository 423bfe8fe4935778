//! Response Header Model
//!
//! HTTP header names are case-insensitive and may repeat. This module
//! provides the accumulator used while assembling a response: keys are
//! canonicalised to ASCII lowercase on insert, repeated keys join their
//! values with `", "` in arrival order, and lookups ignore case. It also
//! carries the transfer-info structure that rides downstream beside the
//! first body chunk.

// Layer 1: Standard library imports
use std::collections::BTreeMap;

// Layer 2: Third-party crate imports
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Case-insensitive response header map with deterministic join semantics.
///
/// # Examples
///
/// ```rust
/// use rivulet_httpsrc::headers::HeaderTable;
///
/// let mut headers = HeaderTable::new();
/// headers.insert("Set-Cookie", "a=1");
/// headers.insert("set-cookie", "b=2");
/// assert_eq!(headers.get("SET-COOKIE"), Some("a=1, b=2"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderTable {
    // Arrival order matters for the join semantics, so no map type here.
    entries: Vec<(String, String)>,
}

impl HeaderTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Drop every stored header (a re-sent status line resets the accumulator)
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Store a header, joining with `", "` when the key already exists.
    ///
    /// The key is canonicalised to ASCII lowercase; the value is stored
    /// verbatim apart from surrounding whitespace.
    pub fn insert(&mut self, key: &str, value: &str) {
        let key = key.to_ascii_lowercase();
        let value = value.trim();
        if let Some((_, existing)) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            existing.push_str(", ");
            existing.push_str(value);
        } else {
            self.entries.push((key, value.to_owned()));
        }
    }

    /// Look up a header, ignoring the case of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Number of distinct header names stored
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no headers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(name, joined-value)` pairs in arrival order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parse the `content-length` header, if present and numeric.
    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length")?.trim().parse().ok()
    }
}

impl Serialize for HeaderTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Parse the total resource size out of a `Content-Range` value.
///
/// For a range response the Content-Length is only the span requested;
/// the figure after `/` is the full size. `*` means the server does not
/// know it.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let total = value.rsplit('/').next()?.trim();
    total.parse().ok()
}

/// The structure that rides alongside the data stream.
///
/// Published as a sticky event just before the first body chunk and posted
/// to the message bus with the same content. Serialises with the on-bus
/// field spelling.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransferInfo {
    /// Request URI at the time the transfer started
    pub uri: String,
    /// Verbatim request headers that were sent
    #[serde(rename = "request-headers")]
    pub request_headers: BTreeMap<String, String>,
    /// Accumulated response headers
    #[serde(rename = "response-headers")]
    pub response_headers: HeaderTable,
    /// Status of the most recent status line, 0 before any response
    #[serde(rename = "http-status-code")]
    pub status_code: u16,
    /// Effective URI when it differs from the request URI
    #[serde(rename = "redirection-uri", skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

impl TransferInfo {
    /// A fresh holder carrying only the URI and request headers.
    pub fn new(uri: impl Into<String>, request_headers: BTreeMap<String, String>) -> Self {
        Self {
            uri: uri.into(),
            request_headers,
            response_headers: HeaderTable::new(),
            status_code: 0,
            redirect_uri: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_case_insensitive_get() {
        let mut headers = HeaderTable::new();
        headers.insert("Content-Type", "text/html");
        assert_eq!(headers.get("content-type"), Some("text/html"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
        assert_eq!(headers.get("content-length"), None);
    }

    #[test]
    fn test_repeated_keys_join_in_arrival_order() {
        let mut headers = HeaderTable::new();
        headers.insert("Warning", "110 stale");
        headers.insert("warning", "112 disconnected");
        headers.insert("WARNING", "199 misc");
        assert_eq!(
            headers.get("warning"),
            Some("110 stale, 112 disconnected, 199 misc")
        );
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_value_whitespace_trimmed() {
        let mut headers = HeaderTable::new();
        headers.insert("Accept-Ranges", " bytes\r\n");
        assert_eq!(headers.get("accept-ranges"), Some("bytes"));
    }

    #[test]
    fn test_content_length_helper() {
        let mut headers = HeaderTable::new();
        headers.insert("Content-Length", "5120");
        assert_eq!(headers.content_length(), Some(5120));
        headers.clear();
        headers.insert("Content-Length", "not-a-number");
        assert_eq!(headers.content_length(), None);
    }

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 5-9/10"), Some(10));
        assert_eq!(parse_content_range_total("bytes 0-499/1234567"), Some(1234567));
        assert_eq!(parse_content_range_total("bytes 5-9/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_transfer_info_serialises_with_bus_spelling() {
        let mut info = TransferInfo::new("http://example.test/a", BTreeMap::new());
        info.status_code = 200;
        info.response_headers.insert("Content-Length", "5");
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["uri"], "http://example.test/a");
        assert_eq!(value["http-status-code"], 200);
        assert_eq!(value["response-headers"]["content-length"], "5");
        assert!(value.get("redirection-uri").is_none());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Lookups must be insensitive to the casing of both the stored
            // and the queried name.
            #[test]
            fn lookup_ignores_name_case(name in "[A-Za-z][A-Za-z0-9-]{0,24}", value in "[ -~]{0,32}") {
                let mut headers = HeaderTable::new();
                headers.insert(&name, &value);
                let upper = name.to_ascii_uppercase();
                let lower = name.to_ascii_lowercase();
                prop_assert_eq!(headers.get(&upper), Some(value.trim()));
                prop_assert_eq!(headers.get(&lower), Some(value.trim()));
            }

            // Join order must follow arrival order regardless of casing.
            #[test]
            fn join_preserves_arrival_order(name in "[A-Za-z][A-Za-z0-9-]{0,16}", a in "[a-z0-9]{1,8}", b in "[a-z0-9]{1,8}") {
                let mut headers = HeaderTable::new();
                headers.insert(&name.to_ascii_uppercase(), &a);
                headers.insert(&name.to_ascii_lowercase(), &b);
                let joined = format!("{a}, {b}");
                prop_assert_eq!(headers.get(&name), Some(joined.as_str()));
            }
        }
    }
}
