//! Codec for encoding and decoding Courier frames.
//!
//! MessagePack serialization with length-prefixed framing. The codec is
//! generic so the same framing carries client frames and cluster frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

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

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

fn read_length(data: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX_SIZE] = data.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}

/// Encode a frame to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(frame: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    let length = read_length(data)
        .ok_or(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE.saturating_sub(data.len())))?;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    let body = data
        .get(LENGTH_PREFIX_SIZE..total_size)
        .ok_or(ProtocolError::Incomplete(total_size.saturating_sub(data.len())))?;

    Ok(rmp_serde::from_slice(body)?)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    let Some(length) = read_length(buf) else {
        return Ok(None);
    };

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let frame = rmp_serde::from_slice(&payload)?;

    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessMode;
    use crate::cluster::{ClusterAction, ClusterFrame};
    use crate::frames::Frame;

    #[test]
    fn test_encode_decode_roundtrip() {
        let frames = vec![
            Frame::subscribe(1, "grp1", AccessMode::Read),
            Frame::publish(2, "grp1", b"Hello, world!".to_vec()),
            Frame::ack(2, "grp1", Some(1), 1_700_000_000_000),
            Frame::error(3, 404, "Topic not found: grp9"),
            Frame::connect(1, Some("usr:alice".to_string())),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded: Frame = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_cluster_frame_roundtrip() {
        let frame = ClusterFrame::request(9, "n1", "n2", ClusterAction::Relay, "grp1", vec![1, 2]);
        let encoded = encode(&frame).unwrap();
        let decoded: ClusterFrame = decode(&encoded).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::subscribe(1, "test", AccessMode::Write);
        let encoded = encode(&frame).unwrap();

        match decode::<Frame>(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
        match decode::<Frame>(&encoded[..2]) {
            Err(ProtocolError::Incomplete(2)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let large_payload = vec![0u8; MAX_FRAME_SIZE + 1];
        let frame = Frame::publish(1, "test", large_payload);

        match encode(&frame) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::subscribe(1, "test1", AccessMode::Write);
        let frame2 = Frame::leave(2, "test2");

        let mut buf = BytesMut::new();
        encode_into(&frame1, &mut buf).unwrap();
        encode_into(&frame2, &mut buf).unwrap();
        let tail = buf.split_off(buf.len() - 3);

        let decoded1: Frame = decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(frame1, decoded1);
        assert!(decode_from::<Frame>(&mut buf).unwrap().is_none());

        buf.unsplit(tail);
        let decoded2: Frame = decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(frame2, decoded2);
        assert!(buf.is_empty());
    }
}
