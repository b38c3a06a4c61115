//! Per-call byte stream over fragmented packets.
//!
//! A `PacketStream` presents one logical message in each direction as a plain
//! byte stream. Outbound bytes are packed into packets of the connection's
//! packet capacity and enqueued to the writer task; inbound packets are pushed
//! by the connection's reader loop and drained by `read`.
//!
//! Outbound fragmentation of an `s`-byte message with capacity `c`:
//!
//! ```text
//! s <= c          SINGLE
//! s >  c          START, MIDDLE x (P - 2), END      where P = ceil(s / c)
//! ```
//!
//! The inbound side enforces the same grammar: the first packet must be START
//! or SINGLE, continuation packets must be MIDDLE or END, and nothing may be
//! read past the END/SINGLE packet.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::MuxConfig;
use crate::error::{MuxError, Result};
use crate::pool::{PacketPool, PooledPacket};
use crate::protocol::FragmentType;
use crate::writer::WriterHandle;

/// Item carried by a stream's reader queue.
#[derive(Debug)]
pub(crate) enum Inbound {
    Packet(PooledPacket),
    /// Wakes a blocked reader with [`MuxError::Disconnected`].
    Disconnect,
}

/// Producer side of a stream's reader queue.
///
/// Held by the connection's active table; pushing never blocks.
#[derive(Debug, Clone)]
pub struct PacketSink {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl PacketSink {
    /// Hand an inbound packet to the stream.
    pub fn push_packet(&self, packet: PooledPacket) {
        if self.tx.send(Inbound::Packet(packet)).is_err() {
            tracing::trace!("packet stream gone, inbound packet released");
        }
    }

    /// Make the stream's pending or next read fail with `Disconnected`.
    pub fn disconnect(&self) {
        let _ = self.tx.send(Inbound::Disconnect);
    }
}

/// One call's view of the connection.
pub struct PacketStream {
    request_id: Option<u8>,
    sink: PacketSink,
    reader_queue: mpsc::UnboundedReceiver<Inbound>,
    writer: WriterHandle,
    packets: PacketPool,
    current_read: Option<PooledPacket>,
    /// Outbound packet being filled; `None` between messages.
    current_write: Option<PooledPacket>,
    read_timeout: Duration,
    write_timeout: Duration,
    max_message_size: usize,
}

impl std::fmt::Debug for PacketStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketStream")
            .field("request_id", &self.request_id)
            .field("reading", &self.current_read.is_some())
            .field("writing", &self.current_write.is_some())
            .finish()
    }
}

impl PacketStream {
    pub fn new(writer: WriterHandle, packets: PacketPool, config: &MuxConfig) -> Self {
        let (tx, reader_queue) = mpsc::unbounded_channel();
        Self {
            request_id: None,
            sink: PacketSink { tx },
            reader_queue,
            writer,
            packets,
            current_read: None,
            current_write: None,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            max_message_size: config.max_message_size,
        }
    }

    #[inline]
    pub fn request_id(&self) -> Option<u8> {
        self.request_id
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.request_id.is_some()
    }

    /// Producer handle for this stream's reader queue.
    pub fn sink(&self) -> PacketSink {
        self.sink.clone()
    }

    /// Bind to `request_id` without touching either direction.
    ///
    /// The first outbound packet is opened by the first `write`, the first
    /// inbound packet is fetched by the first `read`. Used by the calling side,
    /// which writes its request before anything can arrive.
    ///
    /// # Panics
    ///
    /// Panics if the stream is already bound.
    pub fn bind(&mut self, request_id: u8) {
        assert!(
            self.request_id.is_none(),
            "packet stream already bound to request {:?}",
            self.request_id
        );
        self.request_id = Some(request_id);
    }

    /// Bind to `request_id`, wait for the first inbound packet and open the
    /// first outbound packet.
    ///
    /// Fails if no packet arrives within the read timeout or if the first
    /// packet is not START or SINGLE.
    ///
    /// # Panics
    ///
    /// Panics if the stream is already bound.
    pub async fn initialize(&mut self, request_id: u8) -> Result<()> {
        self.bind(request_id);
        self.prefetch().await?;
        let packet = self.acquire_write_packet(FragmentType::Start).await?;
        self.current_write = Some(packet);
        Ok(())
    }

    /// Fill `buf` completely from the inbound message.
    ///
    /// Crosses packet boundaries as needed. Fails without a partial result if
    /// the message ends first, a packet times out, a new message starts, or the
    /// stream is disconnected.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let ends = match self.current_read.as_mut() {
                Some(packet) => {
                    filled += packet.read_data(&mut buf[filled..]);
                    if filled == buf.len() {
                        break;
                    }
                    packet.fragment_type().ends_message()
                }
                None => {
                    self.prefetch().await?;
                    continue;
                }
            };
            if ends {
                return Err(MuxError::Protocol(format!(
                    "request {:?}: message ended {} bytes short",
                    self.request_id,
                    buf.len() - filled
                )));
            }
            self.advance().await?;
        }
        Ok(())
    }

    /// Read the rest of the inbound message, through its END or SINGLE packet.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut message = Vec::new();
        loop {
            let ends = match self.current_read.as_mut() {
                Some(packet) => {
                    packet.read_unread_into(&mut message);
                    packet.fragment_type().ends_message()
                }
                None => {
                    self.prefetch().await?;
                    continue;
                }
            };
            if message.len() > self.max_message_size {
                return Err(MuxError::Protocol(format!(
                    "request {:?}: message exceeds {} bytes",
                    self.request_id, self.max_message_size
                )));
            }
            if ends {
                return Ok(message);
            }
            self.advance().await?;
        }
    }

    /// Append `buf` to the outbound message.
    ///
    /// Every packet that fills up is enqueued to the writer and replaced by a
    /// fresh MIDDLE packet. The last, partially filled packet stays open until
    /// `flush`.
    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        let mut remaining = buf;
        let mut packet = match self.current_write.take() {
            Some(packet) => packet,
            None => self.acquire_write_packet(FragmentType::Start).await?,
        };
        loop {
            let n = packet.write_data(remaining);
            remaining = &remaining[n..];
            if remaining.is_empty() {
                self.current_write = Some(packet);
                return Ok(());
            }
            self.writer.send(packet).await?;
            packet = self.acquire_write_packet(FragmentType::Middle).await?;
        }
    }

    /// Close the outbound message and enqueue its last packet.
    ///
    /// START becomes SINGLE, MIDDLE becomes END. With no message open this is
    /// a no-op; the next `write` opens a new START packet.
    pub async fn flush(&mut self) -> Result<()> {
        let Some(mut packet) = self.current_write.take() else {
            return Ok(());
        };
        let closing = match packet.fragment_type() {
            FragmentType::Start => FragmentType::Single,
            _ => FragmentType::End,
        };
        packet.set_fragment_type(closing);
        self.writer.send(packet).await
    }

    /// Flush, release any held packets and unbind.
    pub async fn shutdown(&mut self) -> Result<()> {
        let flushed = self.flush().await;
        self.current_read = None;
        self.current_write = None;
        self.request_id = None;
        flushed
    }

    /// Release held and queued packets and unbind, sending nothing.
    pub fn reset(&mut self) {
        self.current_read = None;
        self.current_write = None;
        self.clear_reader_queue();
        self.request_id = None;
    }

    /// Flush what has been written, then force the reader into the
    /// disconnected state.
    pub async fn disconnect(&mut self) {
        if let Err(e) = self.flush().await {
            tracing::debug!(request_id = ?self.request_id, error = %e, "flush on disconnect failed");
        }
        self.sink.disconnect();
    }

    /// Hand an inbound packet to this stream.
    pub fn push_packet(&self, packet: PooledPacket) {
        self.sink.push_packet(packet);
    }

    /// Release every queued inbound packet. Returns how many were dropped.
    pub fn clear_reader_queue(&mut self) -> usize {
        let mut cleared = 0;
        while let Ok(item) = self.reader_queue.try_recv() {
            if let Inbound::Packet(packet) = item {
                drop(packet);
                cleared += 1;
            }
        }
        cleared
    }

    async fn next_inbound(&mut self) -> Result<PooledPacket> {
        match tokio::time::timeout(self.read_timeout, self.reader_queue.recv()).await {
            Err(_) => Err(MuxError::ReadTimeout),
            Ok(Some(Inbound::Packet(packet))) => Ok(packet),
            Ok(Some(Inbound::Disconnect)) | Ok(None) => Err(MuxError::Disconnected),
        }
    }

    /// Fetch the first packet of the inbound message.
    async fn prefetch(&mut self) -> Result<()> {
        let packet = self.next_inbound().await?;
        if !packet.fragment_type().begins_message() {
            return Err(MuxError::Protocol(format!(
                "request {:?}: message opened with {:?}",
                self.request_id,
                packet.fragment_type()
            )));
        }
        self.current_read = Some(packet);
        Ok(())
    }

    /// Replace the exhausted current packet with the next continuation packet.
    async fn advance(&mut self) -> Result<()> {
        let packet = self.next_inbound().await?;
        if packet.fragment_type().begins_message() {
            return Err(MuxError::Protocol(format!(
                "request {:?}: {:?} arrived before the previous message ended",
                self.request_id,
                packet.fragment_type()
            )));
        }
        self.current_read = Some(packet);
        Ok(())
    }

    // Borrows only the packet pool across the await, not the whole stream.
    fn acquire_write_packet(
        &self,
        fragment_type: FragmentType,
    ) -> impl Future<Output = Result<PooledPacket>> + '_ {
        let Some(request_id) = self.request_id else {
            panic!("write on a packet stream that is not bound to a request");
        };
        acquire_packet(&self.packets, self.write_timeout, request_id, fragment_type)
    }
}

async fn acquire_packet(
    packets: &PacketPool,
    timeout: Duration,
    request_id: u8,
    fragment_type: FragmentType,
) -> Result<PooledPacket> {
    let mut packet = packets
        .acquire_timeout(timeout)
        .await
        .ok_or(MuxError::WriteTimeout)?;
    packet.set_request_id(request_id);
    packet.set_fragment_type(fragment_type);
    Ok(packet)
}
