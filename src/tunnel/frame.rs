//! Frame encoding/decoding for the tunnel wire
//!
//! Frame format (all integers little-endian):
//! ```text
//! +--------+--------+--------+--------+
//! |   Conn ID (2B)  |   Length (2B)   |
//! +--------+--------+--------+--------+
//! |          Sequence (4B)            |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```
//!
//! A zero `Length` marks a control frame: the sequence field then carries a
//! [`Signal`](crate::protocol::Signal) code instead of a sequence number.

use crate::protocol::{ProtocolError, Signal};
use crate::MAX_FRAME_PAYLOAD;
use bytes::{BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 8;

/// Decoded fixed header, before the payload has been read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Connection id (0 for tunnel-level control frames)
    pub conn_id: u16,
    /// Payload byte count; 0 marks a control frame
    pub length: u16,
    /// Sequence number, or signal code when `length == 0`
    pub seq: u32,
}

impl FrameHeader {
    /// Whether this header announces a control frame
    pub fn is_control(&self) -> bool {
        self.length == 0
    }

    /// Interpret the sequence field as a control signal
    pub fn signal(&self) -> Result<Signal, ProtocolError> {
        Signal::try_from(self.seq)
    }
}

/// A framed message carried on the tunnel wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Connection id (0 for tunnel-level control frames)
    pub conn_id: u16,
    /// Sequence number, or signal code for control frames
    pub seq: u32,
    /// Payload data (empty for control frames)
    pub payload: Bytes,
}

impl Frame {
    /// Create a data frame
    pub fn data(conn_id: u16, seq: u32, payload: Bytes) -> Self {
        Self {
            conn_id,
            seq,
            payload,
        }
    }

    /// Create a control frame bound to a connection
    pub fn control(conn_id: u16, signal: Signal) -> Self {
        Self {
            conn_id,
            seq: signal as u32,
            payload: Bytes::new(),
        }
    }

    /// Whether this is a control frame
    pub fn is_control(&self) -> bool {
        self.payload.is_empty()
    }

    /// Interpret the sequence field as a control signal
    pub fn signal(&self) -> Result<Signal, ProtocolError> {
        Signal::try_from(self.seq)
    }

    /// Encode to wire bytes. The payload is copied, never mutated.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        if self.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u16_le(self.conn_id);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_u32_le(self.seq);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode a fixed 8-byte header. The caller must then read exactly
    /// `length` payload bytes from the same stream.
    pub fn decode_header(buf: &[u8]) -> Result<FrameHeader, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::ShortHeader(buf.len()));
        }

        Ok(FrameHeader {
            conn_id: u16::from_le_bytes([buf[0], buf[1]]),
            length: u16::from_le_bytes([buf[2], buf[3]]),
            seq: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    /// Total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let original = Frame::data(42, 7, Bytes::from_static(b"Hello, World!"));
        let encoded = original.encode().unwrap();

        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 13);

        let header = Frame::decode_header(&encoded).unwrap();
        assert_eq!(header.conn_id, 42);
        assert_eq!(header.seq, 7);
        assert_eq!(header.length, 13);
        assert_eq!(&encoded[FRAME_HEADER_SIZE..], b"Hello, World!");
    }

    #[test]
    fn test_wire_layout_little_endian() {
        let frame = Frame::data(0x0102, 0x0A0B0C0D, Bytes::from_static(b"x"));
        let encoded = frame.encode().unwrap();

        assert_eq!(
            &encoded[..FRAME_HEADER_SIZE],
            &[0x02, 0x01, 0x01, 0x00, 0x0D, 0x0C, 0x0B, 0x0A]
        );
    }

    #[test]
    fn test_control_frame_is_zero_length() {
        let frame = Frame::control(9, Signal::CreateConn);
        assert!(frame.is_control());
        assert_eq!(frame.signal().unwrap(), Signal::CreateConn);

        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE);

        let header = Frame::decode_header(&encoded).unwrap();
        assert!(header.is_control());
        assert_eq!(header.conn_id, 9);
        assert_eq!(header.signal().unwrap(), Signal::CreateConn);
    }

    #[test]
    fn test_short_header_rejected() {
        assert!(matches!(
            Frame::decode_header(&[0u8; 5]),
            Err(ProtocolError::ShortHeader(5))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let frame = Frame::data(1, 1, Bytes::from(vec![0u8; MAX_FRAME_PAYLOAD + 1]));
        assert!(matches!(
            frame.encode(),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_max_payload_roundtrip() {
        let payload = Bytes::from(vec![0xAB; MAX_FRAME_PAYLOAD]);
        let frame = Frame::data(1, 1, payload.clone());
        let encoded = frame.encode().unwrap();

        let header = Frame::decode_header(&encoded).unwrap();
        assert_eq!(header.length as usize, MAX_FRAME_PAYLOAD);
        assert_eq!(&encoded[FRAME_HEADER_SIZE..], &payload[..]);
    }
}
