//! Error types for muxwire.

use thiserror::Error;

/// Main error type for muxwire operations.
#[derive(Debug, Error)]
pub enum MuxError {
    /// I/O error on the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Framing or envelope violation (bad fragment order, short message, oversized packet).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Peer closed the stream at a packet boundary.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The stream was forced into its disconnected state.
    #[error("Disconnected")]
    Disconnected,

    /// No byte stream is currently bound to the connection.
    #[error("Not connected")]
    NotConnected,

    /// `process_stream` was called while another stream is being processed.
    #[error("Connection is already processing a stream")]
    AlreadyRunning,

    /// No inbound packet arrived within the read timeout.
    #[error("Read timeout")]
    ReadTimeout,

    /// The outbound queue or packet pool stayed full for the write timeout.
    #[error("Write timeout")]
    WriteTimeout,

    /// The whole call did not complete within the call timeout.
    #[error("Call timeout")]
    CallTimeout,

    /// Method ID is not registered on the remote side.
    #[error("Method not found: {0}")]
    MethodNotFound(u8),

    /// Raised by a server-side handler; reported to the caller as [`MuxError::Remote`].
    #[error("Handler error: {0}")]
    Handler(String),

    /// The remote handler failed with the given message.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Configuration value out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for muxwire operations.
pub type Result<T> = std::result::Result<T, MuxError>;
