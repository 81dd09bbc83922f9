//! Codec for encoding and decoding Beacon events.
//!
//! Two encodings are supported: JSON text (one event per WebSocket text
//! message) and MessagePack with length-prefixed framing for binary clients.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wire encoding negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// JSON text messages.
    #[default]
    Json,
    /// Length-prefixed MessagePack binary messages.
    MessagePack,
}

impl Encoding {
    /// Parse an encoding name as given in a connection query string.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Some(Encoding::Json),
            "msgpack" | "messagepack" => Some(Encoding::MessagePack),
            _ => None,
        }
    }
}

/// Encode a value as length-prefixed MessagePack.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded value
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a value into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(value)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a value from length-prefixed MessagePack bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a value from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(value))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
/// A frame that fails to deserialize is still consumed so the stream can
/// resynchronize on the next frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    Ok(Some(rmp_serde::from_slice(&payload)?))
}

/// Encode a value as a JSON string.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_json<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a value from JSON text.
///
/// # Errors
///
/// Returns an error if the text is not valid JSON for `T` or is too large.
pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ClientEvent, ServerEvent};

    #[test]
    fn test_msgpack_roundtrip() {
        let event = ClientEvent::StartDuty {
            operator_id: "D-1".into(),
            route_id: "7".into(),
            vehicle_id: "V-1".into(),
        };
        let encoded = encode(&event).unwrap();
        let decoded: ClientEvent = decode(&encoded).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&ServerEvent::pong(Some(5))).unwrap();

        match decode::<ServerEvent>(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        match decode_from::<ClientEvent>(&mut buf) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let first = ClientEvent::SubscribeRoute { route_id: "7".into() };
        let second = ClientEvent::UnsubscribeRoute { route_id: "7".into() };

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();
        // Partial third frame stays buffered
        buf.extend_from_slice(&[0, 0]);

        assert_eq!(decode_from::<ClientEvent>(&mut buf).unwrap(), Some(first));
        assert_eq!(decode_from::<ClientEvent>(&mut buf).unwrap(), Some(second));
        assert_eq!(decode_from::<ClientEvent>(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_undecodable_frame_is_skipped() {
        let next = ClientEvent::SubscribeRoute { route_id: "7".into() };

        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(&[0xc1, 0xc1, 0xc1]);
        encode_into(&next, &mut buf).unwrap();

        match decode_from::<ClientEvent>(&mut buf) {
            Err(ProtocolError::Decode(_)) => {}
            other => panic!("Expected Decode error, got {:?}", other),
        }
        assert_eq!(decode_from::<ClientEvent>(&mut buf).unwrap(), Some(next));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_json_text() {
        let text = r#"{"event":"subscribe-route","data":{"routeId":"12A"}}"#;
        let event: ClientEvent = decode_json(text).unwrap();
        assert_eq!(event, ClientEvent::SubscribeRoute { route_id: "12A".into() });

        let out = encode_json(&ServerEvent::operator_offline("X", "12A")).unwrap();
        assert!(out.contains(r#""event":"operator-offline""#));
        assert!(out.contains(r#""routeId":"12A""#));
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(matches!(
            decode_json::<ClientEvent>("{not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!(Encoding::from_name("json"), Some(Encoding::Json));
        assert_eq!(Encoding::from_name("MsgPack"), Some(Encoding::MessagePack));
        assert_eq!(Encoding::from_name("xml"), None);
    }
}
