//! Connection processors - one byte stream, many concurrent calls.
//!
//! A connection owns the packet pool, the request-processor pool (with its
//! active table and request-id allocator) and the shared writer queue. While
//! a stream is bound it runs two loops:
//!
//! ```text
//!                    ┌──────────── writer task ◄── writer queue ◄── processors
//! stream ── split ───┤
//!                    └──────────── reader loop ──► active table ──► processors
//! ```
//!
//! The connection moves through `idle → running → stopping → idle`. Only an
//! idle connection accepts a stream; after the stream ends (peer EOF, I/O
//! error, framing violation, or [`stop_async`](ClientConnection::stop_async))
//! every in-flight call is failed, the connection waits for all of them to be
//! released, joins the writer task and is idle again.
//!
//! [`ClientConnection`] issues calls; [`ServerConnection`] answers them with a
//! [`Service`](crate::handler::Service).

mod client;
mod server;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use client::ClientConnection;
pub use server::ServerConnection;

use crate::config::MuxConfig;
use crate::error::{MuxError, Result};
use crate::handler::Service;
use crate::pool::{packet_pool, PacketPool, PooledPacket};
use crate::processor_pool::{ActiveRequest, ProcessorManager, RequestProcessorPool, Route};
use crate::writer::{
    discard_stale, spawn_writer_task, writer_queue, WriterExit, WriterHandle, WriterQueue,
};

enum ConnectionState {
    /// No stream bound; the writer queue receiver is parked here.
    Idle(WriterQueue),
    Running(CancellationToken),
    Stopping,
    /// The writer task panicked or was aborted and took the queue receiver with it.
    Closed,
}

/// How unrouted packets are treated.
pub(crate) enum Role {
    /// Every inbound packet must answer a call this side made.
    Client,
    /// A message start on a free request id opens a new inbound call.
    Server(Arc<dyn Service>),
}

/// A stream that has been bound by [`ConnectionCore::start`] but whose reader
/// loop has not run yet.
pub(crate) struct RunningStream<S> {
    reader: BufReader<ReadHalf<S>>,
    stop: CancellationToken,
    writer_task: JoinHandle<WriterExit>,
}

/// State and loops shared by client and server connections.
pub(crate) struct ConnectionCore {
    config: MuxConfig,
    packets: PacketPool,
    processors: RequestProcessorPool,
    writer: WriterHandle,
    state: Mutex<ConnectionState>,
}

impl ConnectionCore {
    pub(crate) fn new(config: MuxConfig) -> Result<Self> {
        config.validate()?;

        let packets = packet_pool(config.max_packets, config.packet_capacity);
        let (writer, queue) = writer_queue(config.writer_queue_capacity, config.write_timeout);
        let manager = ProcessorManager::new(writer.clone(), packets.clone(), config.clone());
        let processors = RequestProcessorPool::new(config.max_requests, manager);

        Ok(Self {
            config,
            packets,
            processors,
            writer,
            state: Mutex::new(ConnectionState::Idle(queue)),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub(crate) fn config(&self) -> &MuxConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn processors(&self) -> &RequestProcessorPool {
        &self.processors
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(*self.lock_state(), ConnectionState::Running(_))
    }

    pub(crate) fn active_requests(&self) -> usize {
        self.processors.active_count()
    }

    pub(crate) fn packets_in_use(&self) -> usize {
        self.packets.in_use()
    }

    /// Bind `stream`: idle → running, writer task started.
    pub(crate) fn start<S>(&self, stream: S) -> Result<RunningStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let stop = CancellationToken::new();
        let mut state = self.lock_state();
        let mut queue = match std::mem::replace(&mut *state, ConnectionState::Running(stop.clone())) {
            ConnectionState::Idle(queue) => queue,
            previous => {
                let err = match previous {
                    ConnectionState::Closed => MuxError::Disconnected,
                    _ => MuxError::AlreadyRunning,
                };
                *state = previous;
                return Err(err);
            }
        };

        let stale = discard_stale(&mut queue, &self.writer);
        if stale > 0 {
            tracing::debug!(stale, "dropped packets queued after the previous stream");
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let writer_task = spawn_writer_task(queue, write_half, &self.writer, stop.clone());
        self.processors.resume();
        drop(state);

        tracing::debug!("connection started");
        Ok(RunningStream {
            reader: BufReader::new(read_half),
            stop,
            writer_task,
        })
    }

    /// Run the reader loop until the stream ends, then drain and go idle.
    ///
    /// Peer EOF and `stop_async` end the loop cleanly; I/O errors on either
    /// half and framing violations are returned after the drain.
    pub(crate) async fn run<S>(&self, running: RunningStream<S>, role: Role) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let RunningStream {
            mut reader,
            stop,
            writer_task,
        } = running;

        let result = self.read_loop(&mut reader, &stop, &role).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "reader loop failed");
        }

        self.stop_async();
        self.processors.stop_all();
        self.processors.wait_drained().await;

        // Every processor is back in the pool, so the stop marker is the last message.
        if let Err(e) = self.writer.stop().await {
            tracing::warn!(error = %e, "writer task not taking the stop marker, aborting it");
            writer_task.abort();
        }
        let (parked, written) = match writer_task.await {
            Ok((queue, written)) => (ConnectionState::Idle(queue), written),
            Err(e) => {
                tracing::warn!(error = %e, "writer task failed");
                (ConnectionState::Closed, Ok(()))
            }
        };
        drop(reader);

        *self.lock_state() = parked;
        tracing::debug!("connection stopped");
        result.and(written)
    }

    /// Request a stop: running → stopping.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub(crate) fn stop_async(&self) -> bool {
        let mut state = self.lock_state();
        match std::mem::replace(&mut *state, ConnectionState::Stopping) {
            ConnectionState::Running(stop) => {
                tracing::debug!("connection stopping");
                stop.cancel();
                true
            }
            previous => {
                *state = previous;
                false
            }
        }
    }

    async fn read_loop<R>(&self, reader: &mut R, stop: &CancellationToken, role: &Role) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let mut packet = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                packet = self.packets.acquire() => packet?,
            };

            let read = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                read = packet.read_from(reader) => read,
            };
            match read {
                Ok(()) => {}
                Err(MuxError::ConnectionClosed) => {
                    tracing::debug!("peer closed the stream");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }

            self.dispatch(packet, role).await?;
        }
    }

    /// Route one inbound packet to the call that owns its request id.
    async fn dispatch(&self, packet: PooledPacket, role: &Role) -> Result<()> {
        let serving = matches!(role, Role::Server(_));
        let packet = match self.processors.route(packet, serving) {
            Route::Delivered => return Ok(()),
            Route::Unregistered(packet) => packet,
            Route::Restarted(packet) => {
                tracing::warn!(
                    request_id = packet.request_id(),
                    fragment_type = ?packet.fragment_type(),
                    "new message on a request id still in flight"
                );
                return Err(MuxError::Protocol(format!(
                    "{:?} packet for request id {} while it is still being served",
                    packet.fragment_type(),
                    packet.request_id()
                )));
            }
        };

        let request_id = packet.request_id();
        match role {
            Role::Server(service) if packet.fragment_type().begins_message() => {
                let active = self.processors.acquire_inbound(request_id).await?;
                active.push_packet(packet);
                tokio::spawn(serve_request(active, service.clone()));
                Ok(())
            }
            _ => {
                tracing::warn!(
                    request_id,
                    fragment_type = ?packet.fragment_type(),
                    "packet for unknown request"
                );
                Err(MuxError::Protocol(format!(
                    "{:?} packet for unknown request id {}",
                    packet.fragment_type(),
                    request_id
                )))
            }
        }
    }
}

/// Serve one inbound call: read the request, run the service, answer.
///
/// The id is deregistered before the final flush: once the peer has seen the
/// end of the response it may reuse the id, and the new call must not be
/// routed to this processor.
async fn serve_request(mut active: ActiveRequest, service: Arc<dyn Service>) {
    let request_id = active.request_id();

    let request = match active.processor_mut().accept(request_id).await {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(request_id, error = %e, "failed to read request");
            return;
        }
    };
    tracing::trace!(request_id, len = request.len(), "serving request");

    let response = service.call(request).await;

    if let Err(e) = active.processor_mut().respond(&response).await {
        tracing::warn!(request_id, error = %e, "failed to write response");
        return;
    }
    active.detach();
    if let Err(e) = active.processor_mut().finish().await {
        tracing::warn!(request_id, error = %e, "failed to finish response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FragmentType, Packet};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn config() -> MuxConfig {
        MuxConfig::default()
            .packet_capacity(256)
            .read_timeout(Duration::from_secs(5))
    }

    fn encoded(request_id: u8, fragment_type: FragmentType, payload: &[u8]) -> Vec<u8> {
        let mut packet = Packet::with_capacity(256);
        packet.set_request_id(request_id);
        packet.set_fragment_type(fragment_type);
        packet.write_data(payload);
        packet.encode()
    }

    #[tokio::test]
    async fn test_start_rejects_second_stream() {
        let core = ConnectionCore::new(config()).unwrap();
        let (stream, _peer) = duplex(1024);
        let running = core.start(stream).unwrap();
        assert!(core.is_running());

        let (other, _other_peer) = duplex(1024);
        assert!(matches!(core.start(other), Err(MuxError::AlreadyRunning)));

        assert!(core.stop_async());
        assert!(!core.stop_async());
        core.run(running, Role::Client).await.unwrap();
        assert!(!core.is_running());
    }

    #[tokio::test]
    async fn test_peer_eof_returns_to_idle() {
        let core = ConnectionCore::new(config()).unwrap();
        for _ in 0..3 {
            let (stream, peer) = duplex(1024);
            let running = core.start(stream).unwrap();
            drop(peer);
            core.run(running, Role::Client).await.unwrap();
            assert!(!core.is_running());
            assert_eq!(core.packets_in_use(), 0);
        }
    }

    #[tokio::test]
    async fn test_client_rejects_unsolicited_packet() {
        let core = ConnectionCore::new(config()).unwrap();
        let (stream, mut peer) = duplex(1024);
        let running = core.start(stream).unwrap();

        peer.write_all(&encoded(5, FragmentType::Single, b"surprise"))
            .await
            .unwrap();
        let result = core.run(running, Role::Client).await;

        assert!(matches!(result, Err(MuxError::Protocol(_))));
        assert_eq!(core.packets_in_use(), 0);
    }

    #[tokio::test]
    async fn test_oversized_packet_is_protocol_error() {
        let core = ConnectionCore::new(config()).unwrap();
        let (stream, mut peer) = duplex(4096);
        let running = core.start(stream).unwrap();

        // Header announcing 1000 bytes against a 256-byte capacity.
        peer.write_all(&[0, FragmentType::Single.as_u8(), 0x03, 0xE8])
            .await
            .unwrap();
        let result = core.run(running, Role::Client).await;
        assert!(matches!(result, Err(MuxError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_server_answers_and_shuts_write_half() {
        let core = ConnectionCore::new(config()).unwrap();
        let (stream, mut peer) = duplex(4096);
        let running = core.start(stream).unwrap();
        let service: Arc<dyn Service> = Arc::new(crate::handler::service_fn(
            |request: Vec<u8>| async move { request.to_ascii_uppercase() },
        ));

        peer.write_all(&encoded(42, FragmentType::Single, b"ping"))
            .await
            .unwrap();

        let mut header = [0u8; crate::protocol::HEADER_SIZE];
        let serve = core.run(running, Role::Server(service));
        let read = async {
            peer.read_exact(&mut header).await.unwrap();
            let mut body = vec![0u8; 4];
            peer.read_exact(&mut body).await.unwrap();
            peer.shutdown().await.unwrap();
            body
        };
        let (result, body) = tokio::join!(serve, read);

        result.unwrap();
        assert_eq!(header[0], 42);
        assert_eq!(header[1], FragmentType::Single.as_u8());
        assert_eq!(body, b"PING");
        assert_eq!(core.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_server_rejects_restart_of_request_in_flight() {
        let core = ConnectionCore::new(config()).unwrap();
        let (stream, mut peer) = duplex(4096);
        let running = core.start(stream).unwrap();
        let service: Arc<dyn Service> =
            Arc::new(crate::handler::service_fn(|request: Vec<u8>| async move { request }));

        peer.write_all(&encoded(3, FragmentType::Start, b"first"))
            .await
            .unwrap();
        peer.write_all(&encoded(3, FragmentType::Single, b"second"))
            .await
            .unwrap();
        let result = core.run(running, Role::Server(service)).await;

        assert!(matches!(result, Err(MuxError::Protocol(_))));
        assert_eq!(core.active_requests(), 0);
        assert_eq!(core.packets_in_use(), 0);
    }
}
