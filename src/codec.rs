//! Stateless CBOR codec for frames and request envelopes.
//!
//! Every socket message is one self-describing CBOR document, so a codec failure is
//! always a single deserialization error rather than partial corruption. The codec
//! performs no I/O and keeps no state; schema checks (tag/chunk agreement, the
//! finish-carries-nothing rule) run as part of [`decode`].

use bytes::Bytes;

use crate::frame::{Frame, RequestEnvelope};
use crate::{Result, TunnelError};

/// Encodes a frame into one wire message.
pub fn encode(frame: &Frame) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(64);
    ciborium::ser::into_writer(frame, &mut buf)
        .map_err(|err| TunnelError::MalformedFrame(err.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decodes one wire message into a frame.
///
/// Fails with [`TunnelError::MalformedFrame`] on truncated input, trailing garbage,
/// schema-invalid documents, and tag/chunk disagreement.
pub fn decode(bytes: &[u8]) -> Result<Frame> {
    let frame: Frame = ciborium::de::from_reader(bytes)
        .map_err(|err| TunnelError::MalformedFrame(err.to_string()))?;
    frame.validated()
}

/// Encodes the opening request envelope.
pub fn encode_envelope(envelope: &RequestEnvelope) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(64);
    ciborium::ser::into_writer(envelope, &mut buf)
        .map_err(|err| TunnelError::MalformedFrame(err.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decodes the opening message into a raw CBOR value.
///
/// Decoding is deliberately loose here: field validation runs separately (see
/// [`RequestEnvelope::from_value`]) so that a schema failure can enumerate every
/// offending field instead of stopping at the first one.
pub fn decode_envelope(bytes: &[u8]) -> Result<ciborium::Value> {
    ciborium::de::from_reader(bytes).map_err(|err| TunnelError::MalformedFrame(err.to_string()))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::{decode, decode_envelope, encode, encode_envelope};
    use crate::frame::{Frame, FrameKind, Method, Payload, RequestEnvelope};
    use crate::headers::HeaderMap;
    use crate::TunnelError;

    fn round_trip(frame: Frame) -> Frame {
        decode(&encode(&frame).unwrap()).unwrap()
    }

    #[test]
    fn test_round_trip_string_frames() {
        for text in ["", "hello", "héllo wörld ✓ 日本語"] {
            let frame = Frame::data(text);
            assert_eq!(round_trip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_round_trip_buffer_frames() {
        // UTF-8-clean byte payloads must stay tagged as buffers, not decay to text.
        for bytes in [
            Bytes::new(),
            Bytes::from_static(&[0, 1, 2, 255]),
            Bytes::from_static(&[1, 2, 3]),
            Bytes::from_static(b"ascii bytes"),
        ] {
            let frame = Frame::data(bytes.clone());
            let decoded = round_trip(frame.clone());
            assert_eq!(decoded, frame);
            assert_eq!(decoded.chunk, Some(Payload::Binary(bytes)));
        }
    }

    #[test]
    fn test_round_trip_json_frames() {
        for value in [
            json!({}),
            json!({"nested": {"list": [1, 2.5, "three"], "ok": true}}),
        ] {
            let frame = Frame::data(value);
            assert_eq!(round_trip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_round_trip_finish_frame() {
        assert_eq!(round_trip(Frame::finish()), Frame::finish());
    }

    #[test]
    fn test_round_trip_head_bearing_frame() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain");
        headers.append("set-cookie", "a=1");
        headers.append("set-cookie", "b=2");
        let frame = Frame::data("chunk").with_head(201, headers);

        let decoded = round_trip(frame.clone());
        assert_eq!(decoded, frame);
        assert!(decoded.has_head());
        assert_eq!(decoded.status, Some(201));
    }

    #[test]
    fn test_decode_truncated_input() {
        let bytes = encode(&Frame::data("truncate me")).unwrap();
        let err = decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, TunnelError::MalformedFrame(_)));
    }

    #[test]
    fn test_decode_rejects_non_frame_document() {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&json!(["not", "a", "frame"]), &mut buf).unwrap();
        assert!(matches!(
            decode(&buf),
            Err(TunnelError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_rejects_tag_chunk_disagreement() {
        // A "buffer" frame whose chunk is a text string.
        let mut frame = Frame::data(Bytes::from_static(b"x"));
        frame.chunk = Some(Payload::Text("x".into()));
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&frame, &mut buf).unwrap();
        assert!(matches!(
            decode(&buf),
            Err(TunnelError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_json_null_chunk() {
        assert_eq!(frame_kind_of(json!(null)), FrameKind::Json);
    }

    fn frame_kind_of(value: serde_json::Value) -> FrameKind {
        let decoded = round_trip(Frame::data(value));
        assert!(decoded.chunk.is_some());
        decoded.kind
    }

    #[test]
    fn test_envelope_round_trip() {
        let mut envelope = RequestEnvelope::new(Method::Put);
        envelope.headers = Some(
            [("accept".to_owned(), "*/*".to_owned())]
                .into_iter()
                .collect(),
        );
        envelope.body = Some(Payload::from(json!({"n": 1})));

        let bytes = encode_envelope(&envelope).unwrap();
        let value = decode_envelope(&bytes).unwrap();
        assert_eq!(RequestEnvelope::from_value(&value).unwrap(), envelope);
    }

    #[test]
    fn test_envelope_garbage_bytes() {
        assert!(matches!(
            decode_envelope(&[0xff, 0x00, 0x12]),
            Err(TunnelError::MalformedFrame(_))
        ));
    }
}
