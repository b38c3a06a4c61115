//! Fixed-capacity packet buffer.
//!
//! A `Packet` carries one header's worth of metadata plus up to `capacity`
//! payload bytes. Packets are recycled through the packet pool, so the
//! payload buffer is allocated once and reused.
//!
//! # Example
//!
//! ```
//! use muxwire::protocol::{FragmentType, Packet};
//!
//! let mut packet = Packet::with_capacity(4);
//! packet.set_request_id(9);
//! packet.set_fragment_type(FragmentType::Single);
//!
//! assert_eq!(packet.write_data(b"hello"), 4);
//! assert!(packet.is_full());
//!
//! let mut out = [0u8; 3];
//! assert_eq!(packet.read_data(&mut out), 3);
//! assert_eq!(&out, b"hel");
//! assert_eq!(packet.unread(), 1);
//! ```

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::wire_format::{FragmentType, PacketHeader, HEADER_SIZE, MAX_PACKET_CAPACITY};
use crate::error::{MuxError, Result};

/// One framed unit on the wire.
#[derive(Debug)]
pub struct Packet {
    request_id: u8,
    fragment_type: FragmentType,
    payload: BytesMut,
    /// Bytes of `payload` already consumed by `read_data`.
    read_pos: usize,
    capacity: usize,
}

impl Packet {
    /// Create an empty packet able to hold `capacity` payload bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity > 0 && capacity <= MAX_PACKET_CAPACITY);
        Self {
            request_id: 0,
            fragment_type: FragmentType::Start,
            payload: BytesMut::with_capacity(capacity),
            read_pos: 0,
            capacity,
        }
    }

    /// Clear payload and metadata, keeping the allocation.
    pub fn reset(&mut self) {
        self.request_id = 0;
        self.fragment_type = FragmentType::Start;
        self.payload.clear();
        self.read_pos = 0;
    }

    #[inline]
    pub fn request_id(&self) -> u8 {
        self.request_id
    }

    #[inline]
    pub fn set_request_id(&mut self, request_id: u8) {
        self.request_id = request_id;
    }

    #[inline]
    pub fn fragment_type(&self) -> FragmentType {
        self.fragment_type
    }

    #[inline]
    pub fn set_fragment_type(&mut self, fragment_type: FragmentType) {
        self.fragment_type = fragment_type;
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Payload bytes currently held.
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.payload.len() >= self.capacity
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload bytes not yet consumed by `read_data`.
    #[inline]
    pub fn unread(&self) -> usize {
        self.payload.len() - self.read_pos
    }

    /// Header describing the current contents.
    pub fn header(&self) -> PacketHeader {
        PacketHeader::new(
            self.request_id,
            self.fragment_type,
            self.payload.len() as u16,
        )
    }

    /// Append as much of `data` as fits. Returns the number of bytes taken.
    pub fn write_data(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.capacity - self.payload.len());
        self.payload.extend_from_slice(&data[..n]);
        n
    }

    /// Copy unread payload into `buf`. Returns the number of bytes copied.
    pub fn read_data(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.unread());
        buf[..n].copy_from_slice(&self.payload[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        n
    }

    /// Move all unread payload onto the end of `out`.
    pub fn read_unread_into(&mut self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.payload[self.read_pos..]);
        self.read_pos = self.payload.len();
    }

    /// Read one framed packet from `reader`, replacing the current contents.
    ///
    /// End of stream before the first header byte is reported as
    /// [`MuxError::ConnectionClosed`]; ending anywhere later is an I/O error.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut header_buf = [0u8; HEADER_SIZE];
        if reader.read(&mut header_buf[..1]).await? == 0 {
            return Err(MuxError::ConnectionClosed);
        }
        // A stream that ends inside the header is truncated, not closed.
        reader.read_exact(&mut header_buf[1..]).await?;

        let header = PacketHeader::decode(&header_buf)?;
        header.validate(self.capacity)?;

        self.request_id = header.request_id;
        self.fragment_type = header.fragment_type;
        self.read_pos = 0;
        self.payload.clear();
        self.payload.resize(header.payload_length as usize, 0);
        reader.read_exact(&mut self.payload[..]).await?;
        Ok(())
    }

    /// Write header and payload to `writer`. Does not flush.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.header().encode()).await?;
        if !self.payload.is_empty() {
            writer.write_all(&self.payload).await?;
        }
        Ok(())
    }

    /// Encode header and payload into a contiguous buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header().encode());
        buf.extend_from_slice(&self.payload);
        buf
    }
}
