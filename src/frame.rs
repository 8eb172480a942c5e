//! # Frame
//!
//! The `frame` module defines the wire data model for one tunneled exchange: the payload
//! variants, the framed messages a server sends, and the request envelope a client opens
//! with. Everything here is a plain value; serialization to bytes lives in [`crate::codec`].
//!
//! ## Message shapes
//!
//! Client → server, exactly one message:
//!
//! ```text
//! { method: "GET" | ... , headers?: map<string, string>, body?: any }
//! ```
//!
//! Server → client, a sequence of frames:
//!
//! ```text
//! { type: "string" | "buffer" | "json" | "finish",
//!   chunk?: <payload>,
//!   headers?: map<string, string | string[]>,   -- first frame only
//!   status?: integer }                          -- first frame only
//! ```
//!
//! Invariants enforced on decode:
//!
//! - `headers`/`status` appear on at most one frame per response, the first one sent;
//! - a `finish` frame carries no chunk and is always the last frame of a response;
//! - the `type` tag and the CBOR representation of `chunk` must agree.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::headers::HeaderMap;
use crate::{Result, TunnelError};

/// One standard HTTP verb, the only methods a request envelope may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Connect,
    Delete,
    Get,
    Head,
    Options,
    Patch,
    Post,
    Put,
    Trace,
}

impl Method {
    /// Every accepted verb, in wire order. Used to enumerate the valid set in
    /// validation messages.
    pub const ALL: [Method; 9] = [
        Method::Connect,
        Method::Delete,
        Method::Get,
        Method::Head,
        Method::Options,
        Method::Patch,
        Method::Post,
        Method::Put,
        Method::Trace,
    ];

    /// The uppercase wire spelling of the verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Connect => "CONNECT",
            Method::Delete => "DELETE",
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Trace => "TRACE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ();

    /// Parses the exact uppercase wire spelling; anything else is rejected.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|method| method.as_str() == s)
            .ok_or(())
    }
}

/// The closed set of logical payload kinds carried by data frames.
///
/// Classification happens once, at the boundary where a chunk enters the state
/// machine, so every consumer can match exhaustively instead of inspecting types
/// at runtime. On the wire the variants map onto CBOR's own shapes: text string,
/// byte string, and everything else.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    /// UTF-8 text.
    Text(String),
    /// Opaque binary data.
    Binary(Bytes),
    /// A structured JSON value.
    Json(serde_json::Value),
}

impl Payload {
    /// The frame kind a data frame carrying this payload is tagged with.
    pub fn kind(&self) -> FrameKind {
        match self {
            Payload::Text(_) => FrameKind::String,
            Payload::Binary(_) => FrameKind::Buffer,
            Payload::Json(_) => FrameKind::Json,
        }
    }

    /// Returns the text content, if this payload is textual.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the raw bytes, if this payload is binary.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_owned())
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Binary(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Binary(Bytes::copy_from_slice(bytes))
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

// An untagged derive resolves variants in declaration order, which misfiles a
// byte string holding UTF-8-clean data as text. Dispatching on the wire shape
// keeps byte strings binary no matter what they contain.
impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PayloadVisitor;

        impl<'de> serde::de::Visitor<'de> for PayloadVisitor {
            type Value = Payload;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a text string, a byte string or a JSON value")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<Payload, E> {
                Ok(Payload::Text(v.to_owned()))
            }

            fn visit_string<E: serde::de::Error>(self, v: String) -> std::result::Result<Payload, E> {
                Ok(Payload::Text(v))
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> std::result::Result<Payload, E> {
                Ok(Payload::Binary(Bytes::copy_from_slice(v)))
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> std::result::Result<Payload, E> {
                Ok(Payload::Binary(Bytes::from(v)))
            }

            fn visit_bool<E: serde::de::Error>(self, v: bool) -> std::result::Result<Payload, E> {
                Ok(Payload::Json(v.into()))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<Payload, E> {
                Ok(Payload::Json(v.into()))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<Payload, E> {
                Ok(Payload::Json(v.into()))
            }

            fn visit_i128<E: serde::de::Error>(self, v: i128) -> std::result::Result<Payload, E> {
                i64::try_from(v)
                    .map(|v| Payload::Json(v.into()))
                    .map_err(|_| E::custom("integer out of range for a JSON number"))
            }

            fn visit_u128<E: serde::de::Error>(self, v: u128) -> std::result::Result<Payload, E> {
                u64::try_from(v)
                    .map(|v| Payload::Json(v.into()))
                    .map_err(|_| E::custom("integer out of range for a JSON number"))
            }

            fn visit_f64<E: serde::de::Error>(self, v: f64) -> std::result::Result<Payload, E> {
                Ok(Payload::Json(v.into()))
            }

            fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<Payload, E> {
                Ok(Payload::Json(serde_json::Value::Null))
            }

            fn visit_none<E: serde::de::Error>(self) -> std::result::Result<Payload, E> {
                Ok(Payload::Json(serde_json::Value::Null))
            }

            fn visit_some<D2>(self, deserializer: D2) -> std::result::Result<Payload, D2::Error>
            where
                D2: serde::Deserializer<'de>,
            {
                deserializer.deserialize_any(PayloadVisitor)
            }

            fn visit_seq<A>(self, seq: A) -> std::result::Result<Payload, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let values = Vec::<serde_json::Value>::deserialize(
                    serde::de::value::SeqAccessDeserializer::new(seq),
                )?;
                Ok(Payload::Json(values.into()))
            }

            fn visit_map<A>(self, map: A) -> std::result::Result<Payload, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let value = serde_json::Value::deserialize(
                    serde::de::value::MapAccessDeserializer::new(map),
                )?;
                Ok(Payload::Json(value))
            }
        }

        deserializer.deserialize_any(PayloadVisitor)
    }
}

/// The tag carried by every server-to-client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// A text chunk; the receiver appends it to the text accumulator.
    String,
    /// A binary chunk; the receiver appends a binary segment.
    Buffer,
    /// A structured chunk; the receiver replaces its last-seen JSON value.
    Json,
    /// Terminal frame. No chunk; nothing may follow it.
    Finish,
}

/// One discrete message of a response, as sent over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Payload kind tag.
    #[serde(rename = "type")]
    pub kind: FrameKind,
    /// Payload, absent on `finish` frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<Payload>,
    /// Response headers, present only on the first frame of a response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderMap>,
    /// Response status code, present only on the first frame of a response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl Frame {
    /// Builds a data frame for the given payload, tagged with the payload's kind.
    pub fn data(payload: impl Into<Payload>) -> Self {
        let payload = payload.into();
        Frame {
            kind: payload.kind(),
            chunk: Some(payload),
            headers: None,
            status: None,
        }
    }

    /// Builds the terminal frame of a response.
    pub fn finish() -> Self {
        Frame {
            kind: FrameKind::Finish,
            chunk: None,
            headers: None,
            status: None,
        }
    }

    /// Attaches the response head. Only ever done to the first frame sent.
    pub fn with_head(mut self, status: u16, headers: HeaderMap) -> Self {
        self.status = Some(status);
        self.headers = Some(headers);
        self
    }

    /// Whether this frame carries the response head.
    pub fn has_head(&self) -> bool {
        self.status.is_some() || self.headers.is_some()
    }

    /// Checks tag/chunk agreement after decoding and applies the two legal
    /// coercions on `json` frames, whose chunks are indistinguishable from other
    /// shapes on the wire: a bare CBOR text string becomes `Value::String`, and
    /// an absent chunk (JSON null encodes as CBOR null) becomes `Value::Null`.
    pub(crate) fn validated(mut self) -> Result<Self> {
        match (self.kind, &self.chunk) {
            (FrameKind::Finish, None) => Ok(self),
            (FrameKind::Finish, Some(_)) => Err(TunnelError::MalformedFrame(
                "finish frame must not carry a chunk".into(),
            )),
            (FrameKind::String, Some(Payload::Text(_))) => Ok(self),
            (FrameKind::Buffer, Some(Payload::Binary(_))) => Ok(self),
            (FrameKind::Json, Some(Payload::Json(_))) => Ok(self),
            (FrameKind::Json, Some(Payload::Text(text))) => {
                self.chunk = Some(Payload::Json(serde_json::Value::String(text.clone())));
                Ok(self)
            }
            // A JSON null chunk serializes to CBOR null, which Option decodes as absent.
            (FrameKind::Json, None) => {
                self.chunk = Some(Payload::Json(serde_json::Value::Null));
                Ok(self)
            }
            (kind, chunk) => Err(TunnelError::MalformedFrame(format!(
                "frame tag {kind:?} does not match chunk {}",
                match chunk {
                    None => "absence".to_owned(),
                    Some(payload) => format!("{:?}", payload.kind()),
                }
            ))),
        }
    }
}

/// The single message that starts an exchange.
///
/// Created by the initiator, sent once as the very first socket message, consumed
/// once by the acceptor, never mutated after send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// The HTTP verb of the virtual request.
    pub method: Method,
    /// Request headers. Keys are matched case-insensitively on the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// Request body, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Payload>,
}

impl RequestEnvelope {
    /// Creates an envelope with no headers and no body.
    pub fn new(method: Method) -> Self {
        RequestEnvelope {
            method,
            headers: None,
            body: None,
        }
    }

    /// Validates a loosely decoded opening message.
    ///
    /// Unlike deserializing straight into `RequestEnvelope`, this walks the raw
    /// CBOR value and collects an issue for every failing field, so the error
    /// response sent back enumerates all of them at once.
    pub fn from_value(value: &ciborium::Value) -> Result<Self> {
        let mut issues: Vec<String> = Vec::new();

        let entries = match value {
            ciborium::Value::Map(entries) => entries.as_slice(),
            _ => {
                return Err(TunnelError::InvalidRequestEnvelope(
                    "envelope: expected a map".into(),
                ))
            }
        };

        let field = |name: &str| {
            entries.iter().find_map(|(key, value)| match key {
                ciborium::Value::Text(key) if key == name => Some(value),
                _ => None,
            })
        };

        let method = match field("method") {
            Some(ciborium::Value::Text(text)) => match Method::from_str(text) {
                Ok(method) => Some(method),
                Err(()) => {
                    issues.push(format!(
                        "method: expected one of {}, got {text:?}",
                        Method::ALL.map(|m| m.as_str()).join(", ")
                    ));
                    None
                }
            },
            Some(_) => {
                issues.push("method: expected a string".into());
                None
            }
            None => {
                issues.push("method: required".into());
                None
            }
        };

        let headers = match field("headers") {
            Some(ciborium::Value::Map(pairs)) => {
                let mut headers = HashMap::with_capacity(pairs.len());
                let mut valid = true;
                for (key, value) in pairs {
                    match (key, value) {
                        (ciborium::Value::Text(key), ciborium::Value::Text(value)) => {
                            headers.insert(key.to_ascii_lowercase(), value.clone());
                        }
                        _ => {
                            issues.push("headers: expected a map of string to string".into());
                            valid = false;
                            break;
                        }
                    }
                }
                valid.then_some(headers)
            }
            Some(_) => {
                issues.push("headers: expected a map of string to string".into());
                None
            }
            None => None,
        };

        let body = match field("body") {
            Some(value) => match value.deserialized::<Payload>() {
                Ok(payload) => Some(payload),
                Err(_) => {
                    issues.push("body: value is not representable as text, bytes or JSON".into());
                    None
                }
            },
            None => None,
        };

        if !issues.is_empty() {
            return Err(TunnelError::InvalidRequestEnvelope(issues.join("; ")));
        }

        Ok(RequestEnvelope {
            // Checked above: no issues means the method parsed.
            method: method.expect("method validated"),
            headers,
            body,
        })
    }
}
