//! Protocol module - wire format and packets.
//!
//! This module implements the binary framing of the data plane:
//! - 4-byte packet header encoding/decoding
//! - Fixed-capacity packet buffers with async read/write

mod packet;
mod wire_format;

pub use packet::Packet;
pub use wire_format::{
    FragmentType, PacketHeader, DEFAULT_PACKET_CAPACITY, HEADER_SIZE, MAX_PACKET_CAPACITY,
    MAX_REQUEST_IDS,
};
