//! Dedicated writer task for outbound packets.
//!
//! Every request processor of a connection funnels its packets through one
//! bounded queue into a single writer task, which owns the write half of the
//! byte stream.
//!
//! # Architecture
//!
//! ```text
//! Request 1 ─┐
//! Request 2 ─┼─► mpsc::Sender<WriterMessage> ─► Writer Task ─► BufWriter ─► Stream
//! Request N ─┘
//! ```
//!
//! The queue outlives any single stream: it is created with the connection,
//! its receiver is lent to the writer task for the lifetime of one stream and
//! handed back when the task exits.
//!
//! - **Flush batching**: the buffered writer is flushed only when the queue is
//!   observed empty right after a write, so bursts coalesce into few syscalls.
//! - **Backpressure**: `send` waits for queue space, up to the write timeout.
//! - **Failure**: a write error cancels the connection's stop token, then the
//!   task keeps draining (and releasing) packets until it sees the stop marker.
//! - **Stop**: once the stop token is cancelled, a write or flush that cannot
//!   make progress is abandoned, so a peer that stopped reading cannot hold
//!   the connection open.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{MuxError, Result};
use crate::pool::PooledPacket;

/// Item carried by the writer queue.
#[derive(Debug)]
pub(crate) enum WriterMessage {
    /// Write this packet, then release it.
    Packet(PooledPacket),
    /// Flush and exit; queued after every request processor has finished.
    Stop,
}

/// Receiving end of the writer queue.
pub(crate) type WriterQueue = mpsc::Receiver<WriterMessage>;

/// Handle for enqueueing packets to the writer task.
///
/// This is cheaply cloneable and shared by every request processor.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterMessage>,
    /// Packets enqueued but not yet written or released.
    queued: Arc<AtomicUsize>,
    timeout: Duration,
}

impl std::fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterHandle")
            .field("queued", &self.queued_count())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl WriterHandle {
    /// Enqueue a packet, waiting up to the write timeout for space.
    ///
    /// On failure the packet is dropped and thereby returned to its pool.
    pub async fn send(&self, packet: PooledPacket) -> Result<()> {
        self.queued.fetch_add(1, Ordering::AcqRel);
        match self
            .tx
            .send_timeout(WriterMessage::Packet(packet), self.timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.queued.fetch_sub(1, Ordering::Release);
                Err(match e {
                    SendTimeoutError::Timeout(_) => MuxError::WriteTimeout,
                    SendTimeoutError::Closed(_) => MuxError::Disconnected,
                })
            }
        }
    }

    /// Enqueue the stop marker, waiting up to the write timeout for space.
    pub(crate) async fn stop(&self) -> Result<()> {
        self.tx
            .send_timeout(WriterMessage::Stop, self.timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => MuxError::WriteTimeout,
                SendTimeoutError::Closed(_) => MuxError::Disconnected,
            })
    }

    /// Get current queued packet count.
    #[inline]
    pub fn queued_count(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

/// Create the writer queue: a handle for producers and the receiver to lend
/// to [`spawn_writer_task`].
pub(crate) fn writer_queue(capacity: usize, timeout: Duration) -> (WriterHandle, WriterQueue) {
    let (tx, rx) = mpsc::channel(capacity);
    let handle = WriterHandle {
        tx,
        queued: Arc::new(AtomicUsize::new(0)),
        timeout,
    };
    (handle, rx)
}

/// What the writer task hands back: the queue receiver for reuse, and the
/// write error that stopped the connection, if any.
pub(crate) type WriterExit = (WriterQueue, Result<()>);

/// Spawn the writer task for one stream.
///
/// The task runs until it dequeues [`WriterMessage::Stop`], then shuts the
/// write half down and returns the queue receiver for reuse.
pub(crate) fn spawn_writer_task<W>(
    rx: WriterQueue,
    writer: W,
    handle: &WriterHandle,
    stop: CancellationToken,
) -> JoinHandle<WriterExit>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(writer_loop(rx, writer, handle.queued.clone(), stop))
}

async fn writer_loop<W>(
    mut rx: WriterQueue,
    writer: W,
    queued: Arc<AtomicUsize>,
    stop: CancellationToken,
) -> WriterExit
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    let mut written = Ok(());

    if let Err(e) = write_packets(&mut rx, &mut writer, &queued, &stop).await {
        if stop.is_cancelled() {
            tracing::debug!(error = %e, "write abandoned, connection stopping");
        } else {
            tracing::warn!(error = %e, "writer failed, stopping connection");
            stop.cancel();
            written = Err(e);
        }
        let skipped = skip_queued_packets(&mut rx, &queued).await;
        tracing::debug!(skipped, "released unsent packets");
    }

    let shutdown = tokio::select! {
        biased;
        shutdown = writer.shutdown() => shutdown.map_err(MuxError::from),
        _ = stop.cancelled() => Err(MuxError::Disconnected),
    };
    if let Err(e) = shutdown {
        tracing::debug!(error = %e, "shutdown of write half failed");
    }
    (rx, written)
}

/// Write packets until the stop marker. Flushes whenever the queue runs dry.
///
/// An error means the stop marker has not been consumed yet.
async fn write_packets<W>(
    rx: &mut WriterQueue,
    writer: &mut W,
    queued: &AtomicUsize,
    stop: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let mut message = match rx.recv().await {
            Some(m) => m,
            None => return Ok(()),
        };

        loop {
            let packet = match message {
                WriterMessage::Packet(packet) => packet,
                WriterMessage::Stop => {
                    if let Err(e) = flush(writer, stop).await {
                        tracing::debug!(error = %e, "final flush failed");
                    }
                    return Ok(());
                }
            };

            let written = tokio::select! {
                biased;
                written = packet.write_to(writer) => written,
                _ = stop.cancelled() => Err(MuxError::Disconnected),
            };
            drop(packet);
            queued.fetch_sub(1, Ordering::Release);
            written?;

            match rx.try_recv() {
                Ok(next) => message = next,
                Err(TryRecvError::Empty) => {
                    flush(writer, stop).await?;
                    break;
                }
                Err(TryRecvError::Disconnected) => {
                    flush(writer, stop).await?;
                    return Ok(());
                }
            }
        }
    }
}

/// Flush, giving up once the connection is stopping and the flush blocks.
async fn flush<W>(writer: &mut W, stop: &CancellationToken) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        flushed = writer.flush() => Ok(flushed?),
        _ = stop.cancelled() => Err(MuxError::Disconnected),
    }
}

/// Release queued packets without writing them, up to the stop marker.
async fn skip_queued_packets(rx: &mut WriterQueue, queued: &AtomicUsize) -> usize {
    let mut skipped = 0;
    while let Some(message) = rx.recv().await {
        match message {
            WriterMessage::Packet(packet) => {
                drop(packet);
                queued.fetch_sub(1, Ordering::Release);
                skipped += 1;
            }
            WriterMessage::Stop => break,
        }
    }
    skipped
}

/// Release whatever producers enqueued after the previous writer task exited.
///
/// Called before the queue is lent to a new writer task so that nothing from
/// an earlier stream reaches the next one.
pub(crate) fn discard_stale(rx: &mut WriterQueue, handle: &WriterHandle) -> usize {
    let mut discarded = 0;
    while let Ok(message) = rx.try_recv() {
        if let WriterMessage::Packet(packet) = message {
            drop(packet);
            handle.queued.fetch_sub(1, Ordering::Release);
            discarded += 1;
        }
    }
    discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{packet_pool, PacketPool};
    use crate::protocol::{FragmentType, HEADER_SIZE};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncReadExt};

    async fn make_packet(pool: &PacketPool, request_id: u8, payload: &[u8]) -> PooledPacket {
        let mut packet = pool.acquire().await.unwrap();
        packet.set_request_id(request_id);
        packet.set_fragment_type(FragmentType::Single);
        packet.write_data(payload);
        packet
    }

    /// Records bytes and counts flushes.
    #[derive(Default)]
    struct Recorder {
        bytes: Vec<u8>,
        flushes: Arc<AtomicUsize>,
    }

    impl AsyncWrite for Recorder {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.bytes.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Fails every write.
    struct Broken;

    impl AsyncWrite for Broken {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer gone",
            )))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Accepts nothing, ever.
    struct Stalled;

    impl AsyncWrite for Stalled {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_writer_sends_packets() {
        let pool = packet_pool(8, 64);
        let (client, mut server) = duplex(4096);
        let (handle, rx) = writer_queue(16, Duration::from_secs(1));
        let task = spawn_writer_task(rx, client, &handle, CancellationToken::new());

        handle.send(make_packet(&pool, 3, b"hello").await).await.unwrap();

        let mut buf = [0u8; HEADER_SIZE + 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 3);
        assert_eq!(buf[1], FragmentType::Single.as_u8());
        assert_eq!(&buf[HEADER_SIZE..], b"hello");

        handle.stop().await.unwrap();
        task.await.unwrap();
        assert_eq!(pool.in_use(), 0);
        assert_eq!(handle.queued_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_once_per_drained_burst() {
        let pool = packet_pool(16, 64);
        let (handle, rx) = writer_queue(16, Duration::from_secs(1));

        // Queue the whole burst before the task starts so it never sees an empty queue mid-burst.
        for i in 0..10u8 {
            handle.send(make_packet(&pool, i, b"abcd").await).await.unwrap();
        }
        handle.stop().await.unwrap();

        let flushes = Arc::new(AtomicUsize::new(0));
        let recorder = Recorder {
            bytes: Vec::new(),
            flushes: flushes.clone(),
        };
        let task = spawn_writer_task(rx, recorder, &handle, CancellationToken::new());
        task.await.unwrap();

        // BufWriter::shutdown drains its buffer without flushing the inner writer.
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        assert_eq!(handle.queued_count(), 0);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_releases_queued_packets() {
        let pool = packet_pool(64, 1000);
        let (handle, rx) = writer_queue(64, Duration::from_secs(1));
        for i in 0..32u8 {
            handle
                .send(make_packet(&pool, i, &[i; 1000]).await)
                .await
                .unwrap();
        }
        assert_eq!(pool.in_use(), 32);

        let stop = CancellationToken::new();
        let task = spawn_writer_task(rx, Broken, &handle, stop.clone());

        stop.cancelled().await;
        handle.stop().await.unwrap();
        let (rx, written) = task.await.unwrap();

        assert!(matches!(written, Err(MuxError::Io(_))));
        assert_eq!(pool.in_use(), 0);
        assert_eq!(handle.queued_count(), 0);
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn test_send_times_out_when_queue_full() {
        let pool = packet_pool(4, 16);
        let (handle, _rx) = writer_queue(1, Duration::from_millis(20));

        handle.send(make_packet(&pool, 0, b"a").await).await.unwrap();
        let result = handle.send(make_packet(&pool, 1, b"b").await).await;

        assert!(matches!(result, Err(MuxError::WriteTimeout)));
        // The rejected packet went straight back to the pool.
        assert_eq!(pool.in_use(), 1);
        assert_eq!(handle.queued_count(), 1);
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let pool = packet_pool(4, 16);
        let (handle, rx) = writer_queue(4, Duration::from_secs(1));
        drop(rx);

        let result = handle.send(make_packet(&pool, 0, b"a").await).await;
        assert!(matches!(result, Err(MuxError::Disconnected)));
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_queue_is_returned_for_reuse() {
        let pool = packet_pool(8, 64);
        let (handle, rx) = writer_queue(8, Duration::from_secs(1));

        let (first, _peer1) = duplex(1024);
        let task = spawn_writer_task(rx, first, &handle, CancellationToken::new());
        handle.stop().await.unwrap();
        let (rx, written) = task.await.unwrap();
        assert!(written.is_ok());

        let (second, mut peer2) = duplex(1024);
        let task = spawn_writer_task(rx, second, &handle, CancellationToken::new());
        handle.send(make_packet(&pool, 9, b"again").await).await.unwrap();
        handle.stop().await.unwrap();
        task.await.unwrap();

        let mut received = Vec::new();
        peer2.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), HEADER_SIZE + 5);
        assert_eq!(received[0], 9);
    }

    #[tokio::test]
    async fn test_discard_stale_releases_leftovers() {
        let pool = packet_pool(8, 64);
        let (handle, mut rx) = writer_queue(8, Duration::from_secs(1));
        handle.send(make_packet(&pool, 1, b"late").await).await.unwrap();
        handle.send(make_packet(&pool, 2, b"later").await).await.unwrap();

        assert_eq!(discard_stale(&mut rx, &handle), 2);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(handle.queued_count(), 0);
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn test_stop_abandons_blocked_write() {
        let pool = packet_pool(16, 1000);
        let (handle, rx) = writer_queue(16, Duration::from_secs(1));
        let stop = CancellationToken::new();
        let task = spawn_writer_task(rx, Stalled, &handle, stop.clone());

        // Enough to overflow the BufWriter so the task blocks on the stalled writer.
        for i in 0..12u8 {
            handle.send(make_packet(&pool, i, &[i; 1000]).await).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        stop.cancel();
        handle.stop().await.unwrap();
        let (rx, written) = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("writer task must exit after stop")
            .unwrap();

        // Abandoning a write on stop is not a failure of the stream.
        assert!(written.is_ok());
        assert_eq!(pool.in_use(), 0);
        assert_eq!(handle.queued_count(), 0);
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn test_stop_marker_times_out_on_full_queue() {
        let pool = packet_pool(4, 16);
        let (handle, _rx) = writer_queue(1, Duration::from_millis(20));
        handle.send(make_packet(&pool, 0, b"a").await).await.unwrap();

        assert!(matches!(handle.stop().await, Err(MuxError::WriteTimeout)));
    }
}
