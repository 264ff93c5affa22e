//! Message framing for the cluster channel
//!
//! Wire format:
//! - 4 bytes: length (big-endian, includes type byte)
//! - 1 byte: frame type
//! - N bytes: payload

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::MAX_PAYLOAD;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {got} bytes (max {max})")]
    TooLarge { got: usize, max: usize },
    #[error("zero-length frame")]
    Empty,
    #[error("unknown frame type: {0}")]
    UnknownType(u8),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Handshake request carrying the outlet request URI
    Hello = 0,
    /// Handshake response carrying a 2-byte status
    HelloAck = 1,
    /// Node inventory (`basic_info` JSON)
    Info = 2,
    /// Deflated configuration payload
    Config = 3,
    /// Heartbeat carrying the applied fingerprint
    Ping = 4,
    /// Heartbeat reply
    Pong = 5,
    /// Orderly teardown with an optional reason
    Close = 6,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Hello),
            1 => Ok(Self::HelloAck),
            2 => Ok(Self::Info),
            3 => Ok(Self::Config),
            4 => Ok(Self::Ping),
            5 => Ok(Self::Pong),
            6 => Ok(Self::Close),
            _ => Err(FrameError::UnknownType(value)),
        }
    }
}

/// A framed message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    /// Heartbeat carrying the applied fingerprint.
    pub fn ping(fingerprint: &str) -> Self {
        Self::new(FrameType::Ping, fingerprint.as_bytes().to_vec())
    }

    pub fn pong() -> Self {
        Self::new(FrameType::Pong, vec![])
    }

    pub fn close(reason: &str) -> Self {
        Self::new(FrameType::Close, reason.as_bytes().to_vec())
    }
}

/// Codec for length-prefixed frames
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_payload: MAX_PAYLOAD,
        }
    }

    /// Create a codec with a custom payload cap.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least the length prefix
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length == 0 {
            return Err(FrameError::Empty);
        }
        if length - 1 > self.max_payload {
            return Err(FrameError::TooLarge {
                got: length - 1,
                max: self.max_payload,
            });
        }

        // Need the full frame
        if src.len() < 4 + length {
            return Ok(None);
        }

        src.advance(4);

        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);

        let payload = src.split_to(length - 1).to_vec();

        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.max_payload {
            return Err(FrameError::TooLarge {
                got: item.payload.len(),
                max: self.max_payload,
            });
        }

        let length = 1 + item.payload.len();
        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(FrameType::Config, vec![1, 2, 3, 4, 5]);

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = FrameCodec::new();
        let frame = Frame::ping("0f");

        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        let full = buf.clone();

        let mut partial = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::with_max_payload(8);
        let frame = Frame::new(FrameType::Config, vec![0; 9]);

        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(frame, &mut buf),
            Err(FrameError::TooLarge { got: 9, max: 8 })
        ));

        // An oversized length prefix is rejected before the payload arrives.
        let mut inbound = BytesMut::new();
        inbound.put_u32(100);
        inbound.put_u8(FrameType::Config as u8);
        assert!(matches!(
            codec.decode(&mut inbound),
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(42);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::UnknownType(42))
        ));
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::ping("a"), &mut buf).unwrap();
        codec.encode(Frame::pong(), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.frame_type, FrameType::Ping);
        assert_eq!(second.frame_type, FrameType::Pong);
    }
}
