//! MIME-driven interpretation of assembled response bodies.
//!
//! Once a response body has been reassembled (and decompressed, if a content-encoding
//! chain was declared), the declared media type decides what the logical payload is:
//! a fixed allow-list of textual MIME types causes byte payloads to be decoded as
//! UTF-8 text, and within that set `application/json` additionally attempts a
//! structured parse. Parsing never fails upward: unparsable JSON stays a raw string,
//! and anything outside the textual allow-list stays opaque binary.

use bytes::Bytes;

use crate::frame::Payload;
use crate::headers::HeaderMap;

/// MIME types whose byte payloads are decoded as UTF-8 text.
pub const TEXT_MIME_TYPES: &[&str] = &[
    "application/json",
    "application/xml",
    "application/xhtml+xml",
    "text/html",
    "text/plain",
    "text/xml",
];

/// MIME types that get a structured parse attempt after text decoding.
pub const JSON_MIME_TYPES: &[&str] = &["application/json"];

/// The media type a client advertises accepting: the textual allow-list plus a
/// wildcard, joined for the `accept` header of the request envelope.
pub fn accepted_mime_types() -> String {
    let mut accept = TEXT_MIME_TYPES.join(",");
    accept.push_str(",*/*");
    accept
}

/// Extracts the essence media type (`type/subtype`, parameters stripped) from a
/// response head, defaulting to `text/plain` when absent or unparsable.
pub fn content_type(headers: &HeaderMap) -> String {
    headers
        .split_values("content-type", ';')
        .into_iter()
        .next()
        .and_then(|value| value.parse::<mime::Mime>().ok())
        .map(|mime| mime.essence_str().to_owned())
        .unwrap_or_else(|| mime::TEXT_PLAIN.essence_str().to_owned())
}

/// Interprets a byte payload under the declared media type.
///
/// Textual types decode as UTF-8 (lossily, so a mislabeled body cannot fail the
/// response) and continue through [`interpret_text`]; anything else is returned
/// unchanged as opaque binary.
pub fn interpret_bytes(mime_type: &str, bytes: Bytes) -> Payload {
    if TEXT_MIME_TYPES.contains(&mime_type) {
        let text = String::from_utf8_lossy(&bytes).into_owned();
        return interpret_text(mime_type, text);
    }

    Payload::Binary(bytes)
}

/// Interprets a text payload under the declared media type.
///
/// JSON types get a structured parse attempt; on failure the raw string is returned
/// unchanged. Other types pass through as text.
pub fn interpret_text(mime_type: &str, text: String) -> Payload {
    if JSON_MIME_TYPES.contains(&mime_type) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            return Payload::Json(value);
        }
    }

    Payload::Text(text)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::{accepted_mime_types, content_type, interpret_bytes, interpret_text};
    use crate::frame::Payload;
    use crate::headers::HeaderMap;

    #[test]
    fn test_json_bytes_parse_structured() {
        let payload = interpret_bytes("application/json", Bytes::from_static(b"{\"a\":1}"));
        assert_eq!(payload, Payload::Json(json!({"a": 1})));
    }

    #[test]
    fn test_invalid_json_stays_text() {
        let payload = interpret_bytes("application/json", Bytes::from_static(b"{nope"));
        assert_eq!(payload, Payload::Text("{nope".into()));
    }

    #[test]
    fn test_plain_text_passes_through() {
        let payload = interpret_bytes("text/plain", Bytes::from_static(b"arbitrary text"));
        assert_eq!(payload, Payload::Text("arbitrary text".into()));
    }

    #[test]
    fn test_binary_types_stay_opaque() {
        let bytes = Bytes::from_static(&[0x89, 0x50, 0x4e, 0x47]);
        let payload = interpret_bytes("image/png", bytes.clone());
        assert_eq!(payload, Payload::Binary(bytes));
    }

    #[test]
    fn test_text_interpretation_only_parses_json_types() {
        let payload = interpret_text("text/html", "{\"a\":1}".into());
        assert_eq!(payload, Payload::Text("{\"a\":1}".into()));
    }

    #[test]
    fn test_content_type_strips_parameters() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json; charset=utf-8");
        assert_eq!(content_type(&headers), "application/json");
    }

    #[test]
    fn test_content_type_defaults_to_text_plain() {
        assert_eq!(content_type(&HeaderMap::new()), "text/plain");
    }

    #[test]
    fn test_accept_advertisement() {
        let accept = accepted_mime_types();
        assert!(accept.starts_with("application/json,"));
        assert!(accept.ends_with(",*/*"));
    }
}
