//! Per-call state machine.
//!
//! A `RequestProcessor` owns one [`PacketStream`] and drives exactly one call
//! through it at a time: on the calling side `invoke`, on the serving side
//! `accept` / `respond` / `finish`. Processors are pooled and recycled by the
//! connection; see [`crate::processor_pool`].

use crate::error::Result;
use crate::packet_stream::{PacketSink, PacketStream};

#[derive(Debug)]
pub struct RequestProcessor {
    stream: PacketStream,
}

impl RequestProcessor {
    pub fn new(stream: PacketStream) -> Self {
        Self { stream }
    }

    /// Request ID this processor is bound to, if any.
    #[inline]
    pub fn request_id(&self) -> Option<u8> {
        self.stream.request_id()
    }

    /// Producer handle for inbound packets addressed to this processor.
    pub fn sink(&self) -> PacketSink {
        self.stream.sink()
    }

    /// Direct access for callers that marshal their own framing.
    pub fn stream_mut(&mut self) -> &mut PacketStream {
        &mut self.stream
    }

    pub(crate) fn bind(&mut self, request_id: u8) {
        self.stream.bind(request_id);
    }

    /// Send `request` and wait for the whole response.
    ///
    /// The processor must already be bound. On failure nothing of the
    /// response is returned and the stream is left for the pool to reset.
    pub async fn invoke(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.stream.write(request).await?;
        self.stream.flush().await?;
        let response = self.stream.read_to_end().await?;
        self.stream.shutdown().await?;
        Ok(response)
    }

    /// Bind to an inbound call and read its whole request.
    pub async fn accept(&mut self, request_id: u8) -> Result<Vec<u8>> {
        self.stream.initialize(request_id).await?;
        self.stream.read_to_end().await
    }

    /// Write the response body. Nothing is final until [`finish`](Self::finish).
    pub async fn respond(&mut self, response: &[u8]) -> Result<()> {
        self.stream.write(response).await
    }

    /// Flush the response and unbind.
    pub async fn finish(&mut self) -> Result<()> {
        self.stream.shutdown().await
    }

    /// Drop all per-call state without sending anything.
    pub fn reset(&mut self) {
        self.stream.reset();
    }
}
