//! Codec module - serialization for typed call payloads.
//!
//! The transport itself moves opaque bytes. [`MsgPackCodec`] is what the
//! typed method layer uses to turn arguments and results into those bytes.
//!
//! # Example
//!
//! ```
//! use muxwire::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
