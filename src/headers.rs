//! Ordered, case-insensitive header map used on response frames.
//!
//! The head-bearing frame of a response carries its headers as a map of header name to
//! either a single value or a list of values (multi-valued headers such as `set-cookie`).
//! Insertion order is preserved on the wire, names are normalized to lowercase, and
//! lookups are case-insensitive. The map serializes as a plain CBOR map so the peer can
//! decode it without knowing anything about this crate.

use std::fmt;

use serde::{
    de::{MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};

/// A single header entry: one value, or several for multi-valued headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    /// A single header value.
    One(String),
    /// Multiple values for the same header name.
    Many(Vec<String>),
}

impl HeaderValue {
    /// Returns the first value of this entry.
    ///
    /// For `Many` entries this is the earliest appended value; a `Many` entry is
    /// never empty when built through [`HeaderMap`].
    pub fn first(&self) -> &str {
        match self {
            HeaderValue::One(value) => value,
            HeaderValue::Many(values) => values.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// Appends a value, upgrading a single entry to a list.
    fn push(&mut self, value: String) {
        match self {
            HeaderValue::One(existing) => {
                let existing = std::mem::take(existing);
                *self = HeaderValue::Many(vec![existing, value]);
            }
            HeaderValue::Many(values) => values.push(value),
        }
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::One(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::One(value.to_owned())
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(values: Vec<String>) -> Self {
        HeaderValue::Many(values)
    }
}

/// An ordered mapping of header name to value(s).
///
/// Names are stored lowercased; `get` and friends match case-insensitively. Iteration
/// yields entries in insertion order, which is also the order they appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderMap {
    entries: Vec<(String, HeaderValue)>,
}

impl HeaderMap {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct header names in the map.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no headers at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a header entry by name, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    /// Looks up the first value of a header, case-insensitively.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).map(HeaderValue::first)
    }

    /// Inserts a header, replacing any previous entry with the same name.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<HeaderValue>) {
        let name = name.as_ref().to_ascii_lowercase();
        let value = value.into();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(&name))
        {
            entry.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    /// Appends a value to a header, keeping any previous values.
    pub fn append(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let name = name.as_ref().to_ascii_lowercase();
        let value = value.into();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(&name))
        {
            entry.1.push(value);
        } else {
            self.entries.push((name, HeaderValue::One(value)));
        }
    }

    /// Iterates over entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    /// Splits the first value of a header on a separator, trimming whitespace and
    /// dropping empty pieces.
    ///
    /// This is the usual way to read list-valued headers such as `content-encoding`
    /// (separator `,`) or to peel parameters off `content-type` (separator `;`).
    pub fn split_values(&self, name: &str, separator: char) -> Vec<String> {
        match self.get_str(name) {
            Some(value) => value
                .split(separator)
                .map(str::trim)
                .filter(|piece| !piece.is_empty())
                .map(str::to_owned)
                .collect(),
            None => Vec::new(),
        }
    }
}

impl<N: AsRef<str>, V: Into<HeaderValue>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}

impl Serialize for HeaderMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HeaderMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeaderMapVisitor;

        impl<'de> Visitor<'de> for HeaderMapVisitor {
            type Value = HeaderMap;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of header name to value or list of values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = HeaderMap::new();
                while let Some((name, value)) = access.next_entry::<String, HeaderValue>()? {
                    map.insert(name, value);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(HeaderMapVisitor)
    }
}
