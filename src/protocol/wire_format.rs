//! Wire format encoding and decoding.
//!
//! Every packet starts with a 4-byte header followed by its payload:
//! ```text
//! ┌────────┬──────────┬──────────┐
//! │ Req ID │ Fragment │ Length   │
//! │ 1 byte │ 1 byte   │ 2 bytes  │
//! │        │          │ uint16 BE│
//! └────────┴──────────┴──────────┘
//! ```
//!
//! A logical message is either one SINGLE packet, or a START packet, zero or
//! more MIDDLE packets and an END packet, all carrying the same request ID.

use crate::error::{MuxError, Result};

/// Header size in bytes (fixed, exactly 4).
pub const HEADER_SIZE: usize = 4;

/// Default payload capacity of one packet.
pub const DEFAULT_PACKET_CAPACITY: usize = 4096;

/// Largest payload a header can describe.
pub const MAX_PACKET_CAPACITY: usize = u16::MAX as usize;

/// Number of distinct request IDs (one byte on the wire).
pub const MAX_REQUEST_IDS: usize = 256;

/// Position of a packet within its logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FragmentType {
    /// First packet of a multi-packet message.
    Start = 0,
    /// Interior packet of a multi-packet message.
    Middle = 1,
    /// Last packet of a multi-packet message.
    End = 2,
    /// The whole message in one packet.
    Single = 3,
}

impl FragmentType {
    /// Parse the wire tag.
    #[inline]
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Start),
            1 => Some(Self::Middle),
            2 => Some(Self::End),
            3 => Some(Self::Single),
            _ => None,
        }
    }

    /// The wire tag.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// START or SINGLE.
    #[inline]
    pub fn begins_message(self) -> bool {
        matches!(self, Self::Start | Self::Single)
    }

    /// END or SINGLE.
    #[inline]
    pub fn ends_message(self) -> bool {
        matches!(self, Self::End | Self::Single)
    }
}

impl TryFrom<u8> for FragmentType {
    type Error = MuxError;

    fn try_from(tag: u8) -> Result<Self> {
        Self::from_u8(tag)
            .ok_or_else(|| MuxError::Protocol(format!("unknown fragment type {:#04x}", tag)))
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Request identifier, unique among the calls in flight on one connection.
    pub request_id: u8,
    /// Position within the logical message.
    pub fragment_type: FragmentType,
    /// Payload length in bytes.
    pub payload_length: u16,
}

impl PacketHeader {
    /// Create a new header.
    pub fn new(request_id: u8, fragment_type: FragmentType, payload_length: u16) -> Self {
        Self {
            request_id,
            fragment_type,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use muxwire::protocol::{FragmentType, PacketHeader};
    ///
    /// let header = PacketHeader::new(7, FragmentType::Single, 300);
    /// assert_eq!(header.encode(), [7, 3, 0x01, 0x2C]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (4 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.request_id;
        buf[1] = self.fragment_type.as_u8();
        buf[2..4].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Fails if the buffer is too short or the fragment tag is unknown.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(MuxError::Protocol(format!(
                "header needs {} bytes, got {}",
                HEADER_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            request_id: buf[0],
            fragment_type: FragmentType::try_from(buf[1])?,
            payload_length: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }

    /// Check the payload fits a packet of the given capacity.
    pub fn validate(&self, capacity: usize) -> Result<()> {
        if self.payload_length as usize > capacity {
            return Err(MuxError::Protocol(format!(
                "packet for request {} carries {} bytes, capacity is {}",
                self.request_id, self.payload_length, capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size() {
        assert_eq!(HEADER_SIZE, 4);
        let header = PacketHeader::new(1, FragmentType::Start, 0);
        assert_eq!(header.encode().len(), HEADER_SIZE);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let header = PacketHeader::new(0xAB, FragmentType::Middle, 0x1234);
        let bytes = header.encode();
        let decoded = PacketHeader::decode(&bytes).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_big_endian_length() {
        let header = PacketHeader::new(0, FragmentType::End, 0x0102);
        let bytes = header.encode();
        assert_eq!(bytes[2], 0x01);
        assert_eq!(bytes[3], 0x02);
    }

    #[test]
    fn test_fragment_tags() {
        assert_eq!(FragmentType::Start.as_u8(), 0);
        assert_eq!(FragmentType::Middle.as_u8(), 1);
        assert_eq!(FragmentType::End.as_u8(), 2);
        assert_eq!(FragmentType::Single.as_u8(), 3);
        for tag in 0..4u8 {
            assert_eq!(FragmentType::from_u8(tag).unwrap().as_u8(), tag);
        }
        assert_eq!(FragmentType::from_u8(4), None);
    }

    #[test]
    fn test_message_boundaries() {
        assert!(FragmentType::Start.begins_message());
        assert!(FragmentType::Single.begins_message());
        assert!(!FragmentType::Middle.begins_message());
        assert!(!FragmentType::End.begins_message());

        assert!(FragmentType::End.ends_message());
        assert!(FragmentType::Single.ends_message());
        assert!(!FragmentType::Start.ends_message());
        assert!(!FragmentType::Middle.ends_message());
    }

    #[test]
    fn test_decode_unknown_fragment_type() {
        let result = PacketHeader::decode(&[1, 9, 0, 0]);
        assert!(matches!(result, Err(MuxError::Protocol(_))));
    }

    #[test]
    fn test_decode_short_buffer() {
        let result = PacketHeader::decode(&[1, 0, 0]);
        assert!(matches!(result, Err(MuxError::Protocol(_))));
    }

    #[test]
    fn test_validate_capacity() {
        let header = PacketHeader::new(3, FragmentType::Single, 1024);
        assert!(header.validate(1024).is_ok());
        assert!(header.validate(1023).is_err());
    }

    #[test]
    fn test_max_length() {
        let header = PacketHeader::new(255, FragmentType::Single, u16::MAX);
        let decoded = PacketHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.payload_length as usize, MAX_PACKET_CAPACITY);
        assert_eq!(decoded.request_id, 255);
    }
}
