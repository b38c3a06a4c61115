//! Byte layout of typed calls.
//!
//! ```text
//! request:  [method_id: u8] [MsgPack args]
//! response: [status: u8]    [MsgPack body]
//! ```
//!
//! For `status::OK` the body is the handler's result; for every other status
//! it is a MsgPack string describing the failure.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::MsgPackCodec;
use crate::error::{MuxError, Result};

/// Response status codes.
pub mod status {
    /// Handler succeeded; body is its result.
    pub const OK: u8 = 0;
    /// Handler returned an error.
    pub const HANDLER_ERROR: u8 = 1;
    /// No handler is registered under the method ID.
    pub const METHOD_NOT_FOUND: u8 = 2;
    /// The request could not be decoded.
    pub const BAD_REQUEST: u8 = 3;
}

/// Encode a typed request.
pub fn encode_request<T: Serialize + ?Sized>(method_id: u8, args: &T) -> Result<Vec<u8>> {
    let mut message = vec![method_id];
    MsgPackCodec::encode_into(&mut message, args)?;
    Ok(message)
}

/// Split a request into method ID and encoded arguments.
pub fn split_request(message: &[u8]) -> Result<(u8, &[u8])> {
    match message.split_first() {
        Some((&method_id, args)) => Ok((method_id, args)),
        None => Err(MuxError::Protocol("empty request envelope".to_string())),
    }
}

/// Encode a successful response.
pub fn encode_ok(body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(1 + body.len());
    message.push(status::OK);
    message.extend_from_slice(body);
    message
}

/// Encode a failed response carrying `reason`.
pub fn encode_failure(status: u8, reason: &str) -> Vec<u8> {
    let mut message = vec![status];
    if MsgPackCodec::encode_into(&mut message, reason).is_err() {
        message.truncate(1);
    }
    message
}

/// Decode a response, mapping non-OK statuses to errors.
pub fn decode_response<T: DeserializeOwned>(method_id: u8, message: &[u8]) -> Result<T> {
    let Some((&code, body)) = message.split_first() else {
        return Err(MuxError::Protocol("empty response envelope".to_string()));
    };
    match code {
        status::OK => MsgPackCodec::decode(body),
        status::METHOD_NOT_FOUND => Err(MuxError::MethodNotFound(method_id)),
        status::HANDLER_ERROR => Err(MuxError::Remote(failure_reason(body))),
        status::BAD_REQUEST => Err(MuxError::Protocol(format!(
            "peer rejected request: {}",
            failure_reason(body)
        ))),
        other => Err(MuxError::Protocol(format!(
            "unknown response status {}",
            other
        ))),
    }
}

fn failure_reason(body: &[u8]) -> String {
    MsgPackCodec::decode(body).unwrap_or_else(|_| "<undecodable reason>".to_string())
}
