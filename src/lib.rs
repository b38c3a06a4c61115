//! # muxwire
//!
//! Multiplexed RPC transport: many concurrent calls over one ordered byte
//! stream (a TCP socket, a pipe, `tokio::io::duplex`, ...).
//!
//! Each call is tagged with a one-byte request id, so up to 256 calls can be
//! in flight on one connection. Requests and responses of any size are split
//! into bounded packets, interleaved on the wire and reassembled per call.
//!
//! ## Architecture
//!
//! - **Packets** ([`protocol`]): 4-byte header (request id, fragment type,
//!   payload length) plus at most `packet_capacity` payload bytes
//! - **Packet streams** ([`packet_stream`]): per-call fragmentation and
//!   reassembly on top of pooled packets
//! - **Request processors** ([`request_processor`], [`processor_pool`]): one
//!   call's lifecycle, pooled and indexed by request id
//! - **Connections** ([`connection`]): the single writer task and reader loop
//!   that own the byte stream
//!
//! Memory is bounded by pools and queues: when they are full, producers wait
//! (with timeouts) instead of allocating.
//!
//! ## Example
//!
//! ```
//! use muxwire::{service_fn, ClientConnection, MuxConfig, ServerConnection};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> muxwire::Result<()> {
//! let (client_io, server_io) = tokio::io::duplex(64 * 1024);
//!
//! let server = ServerConnection::new(
//!     MuxConfig::default(),
//!     service_fn(|request: Vec<u8>| async move { request.to_ascii_uppercase() }),
//! )?;
//! let serving = server.spawn(server_io)?;
//!
//! let client = ClientConnection::new(MuxConfig::default())?;
//! let reading = client.spawn(client_io)?;
//!
//! assert_eq!(client.invoke_rpc(b"hello").await?, b"HELLO");
//!
//! client.stop_async();
//! reading.await.ok();
//! serving.await.ok();
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod id_allocator;
pub mod packet_stream;
pub mod pool;
pub mod processor_pool;
pub mod protocol;
pub mod request_processor;
pub mod writer;

pub use config::MuxConfig;
pub use connection::{ClientConnection, ServerConnection};
pub use error::{MuxError, Result};
pub use handler::{service_fn, MethodRegistry, Service};
