//! MsgPack codec using `rmp-serde`.
//!
//! Structs are written as maps keyed by field name (`to_vec_named` /
//! `write_named`), so a peer can add or reorder fields without breaking older
//! readers.
//!
//! # Example
//!
//! ```
//! use muxwire::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Message = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Append the MsgPack encoding of `value` to `buf`.
    #[inline]
    pub fn encode_into<T: serde::Serialize + ?Sized>(buf: &mut Vec<u8>, value: &T) -> Result<()> {
        rmp_serde::encode::write_named(buf, value)?;
        Ok(())
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MuxError;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = Sample {
            id: 42,
            name: "test".to_string(),
            active: true,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: Sample = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_structs_are_maps() {
        let encoded = MsgPackCodec::encode(&Sample {
            id: 1,
            name: "x".to_string(),
            active: false,
        })
        .unwrap();

        // fixmap with 3 entries, not fixarray (0x93)
        assert_eq!(encoded[0], 0x83);
    }

    #[test]
    fn test_encode_into_appends() {
        let mut buf = vec![0xAA];
        MsgPackCodec::encode_into(&mut buf, &7u8).unwrap();
        assert_eq!(buf[0], 0xAA);
        let decoded: u8 = MsgPackCodec::decode(&buf[1..]).unwrap();
        assert_eq!(decoded, 7);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<Sample> = MsgPackCodec::decode(b"not valid msgpack");
        assert!(matches!(result, Err(MuxError::MsgPackDecode(_))));
    }
}
