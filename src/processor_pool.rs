//! Request-processor pool and the connection's active table.
//!
//! The pool bounds how many calls can be in flight. Every checked-out
//! processor is registered in a 256-slot table under its request ID, which is
//! how the reader loop routes inbound packets, and counted as active until it
//! is back in the pool. Stopping a connection walks the table and disconnects
//! every registered stream, then waits for the active count to reach zero.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::config::MuxConfig;
use crate::error::Result;
use crate::id_allocator::RequestIdAllocator;
use crate::packet_stream::{PacketSink, PacketStream};
use crate::pool::{PacketPool, Pool, PoolManager, Pooled, PooledPacket};
use crate::protocol::MAX_REQUEST_IDS;
use crate::request_processor::RequestProcessor;
use crate::writer::WriterHandle;

/// Builds request processors wired to one connection's writer and packet pool.
pub struct ProcessorManager {
    writer: WriterHandle,
    packets: PacketPool,
    config: MuxConfig,
}

impl ProcessorManager {
    pub(crate) fn new(writer: WriterHandle, packets: PacketPool, config: MuxConfig) -> Self {
        Self {
            writer,
            packets,
            config,
        }
    }
}

impl PoolManager for ProcessorManager {
    type Entry = RequestProcessor;

    fn create(&self) -> RequestProcessor {
        RequestProcessor::new(PacketStream::new(
            self.writer.clone(),
            self.packets.clone(),
            &self.config,
        ))
    }

    fn reset(&self, processor: &mut RequestProcessor) {
        processor.reset();
    }
}

struct TableState {
    slots: Vec<Option<PacketSink>>,
    ids: RequestIdAllocator,
    /// Set while the connection is stopping; late registrations are disconnected at once.
    stopping: bool,
}

struct ActiveTable {
    state: Mutex<TableState>,
    active: watch::Sender<usize>,
}

impl ActiveTable {
    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of [`RequestProcessorPool::route`].
#[derive(Debug)]
pub enum Route {
    /// Queued on the registered processor's stream.
    Delivered,
    /// No processor holds this request ID.
    Unregistered(PooledPacket),
    /// A message start for an ID whose call is still being served.
    Restarted(PooledPacket),
}

/// Pool of request processors plus the table of those currently in flight.
pub struct RequestProcessorPool {
    pool: Pool<ProcessorManager>,
    table: Arc<ActiveTable>,
}

impl RequestProcessorPool {
    pub(crate) fn new(capacity: usize, manager: ProcessorManager) -> Self {
        assert!(capacity <= MAX_REQUEST_IDS);
        let (active, _) = watch::channel(0);
        Self {
            pool: Pool::new(capacity, manager),
            table: Arc::new(ActiveTable {
                state: Mutex::new(TableState {
                    slots: vec![None; MAX_REQUEST_IDS],
                    ids: RequestIdAllocator::new(),
                    stopping: false,
                }),
                active,
            }),
        }
    }

    /// Check out a processor for an outgoing call under a freshly allocated ID.
    ///
    /// Waits while `capacity` calls are already in flight.
    pub async fn acquire_outbound(&self) -> Result<ActiveRequest> {
        let mut processor = self.pool.acquire().await?;
        let request_id = {
            let mut state = self.table.lock();
            let request_id = state.ids.acquire();
            register(&mut state, request_id, processor.sink());
            request_id
        };
        processor.bind(request_id);
        Ok(self.activate(processor, request_id, true))
    }

    /// Check out a processor for an incoming call whose ID the peer chose.
    ///
    /// # Panics
    ///
    /// Panics if `request_id` is already registered.
    pub async fn acquire_inbound(&self, request_id: u8) -> Result<ActiveRequest> {
        let processor = self.pool.acquire().await?;
        {
            let mut state = self.table.lock();
            register(&mut state, request_id, processor.sink());
        }
        Ok(self.activate(processor, request_id, false))
    }

    fn activate(
        &self,
        processor: Pooled<ProcessorManager>,
        request_id: u8,
        owns_id: bool,
    ) -> ActiveRequest {
        self.table.active.send_modify(|n| *n += 1);
        ActiveRequest {
            registration: Registration {
                table: self.table.clone(),
                request_id,
                owns_id,
                registered: true,
            },
            processor,
            _active: ActiveGuard {
                table: self.table.clone(),
            },
        }
    }

    /// Push `packet` to the processor registered under its request ID.
    ///
    /// The lookup and the push happen under the table lock, so the processor
    /// cannot be released and its ID handed to a new call in between. With
    /// `serving` set, a packet that starts a new message on an ID still in
    /// flight is handed back as [`Route::Restarted`] instead of being queued.
    pub fn route(&self, packet: PooledPacket, serving: bool) -> Route {
        let state = self.table.lock();
        match &state.slots[packet.request_id() as usize] {
            None => Route::Unregistered(packet),
            Some(_) if serving && packet.fragment_type().begins_message() => {
                Route::Restarted(packet)
            }
            Some(sink) => {
                sink.push_packet(packet);
                Route::Delivered
            }
        }
    }

    /// Visit every registered processor.
    pub fn for_each_active(&self, mut visit: impl FnMut(u8, &PacketSink)) {
        let state = self.table.lock();
        for (request_id, slot) in state.slots.iter().enumerate() {
            if let Some(sink) = slot {
                visit(request_id as u8, sink);
            }
        }
    }

    /// Disconnect every registered processor, and any registered until `resume`.
    pub fn stop_all(&self) {
        self.table.lock().stopping = true;
        self.for_each_active(|_, sink| sink.disconnect());
    }

    /// Accept registrations normally again.
    pub fn resume(&self) {
        self.table.lock().stopping = false;
    }

    /// Processors checked out and not yet returned.
    pub fn active_count(&self) -> usize {
        *self.table.active.borrow()
    }

    /// Wait until every checked-out processor is back in the pool.
    pub async fn wait_drained(&self) {
        let mut active = self.table.active.subscribe();
        // The sender lives in `self.table`, so this cannot observe a closed channel.
        let _ = active.wait_for(|n| *n == 0).await;
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }
}

fn register(state: &mut TableState, request_id: u8, sink: PacketSink) {
    let slot = &mut state.slots[request_id as usize];
    assert!(
        slot.is_none(),
        "request id {} is already registered",
        request_id
    );
    if state.stopping {
        sink.disconnect();
    }
    *slot = Some(sink);
}

/// Table entry of an in-flight call. Removed on `detach` or drop.
struct Registration {
    table: Arc<ActiveTable>,
    request_id: u8,
    /// Calling side: the ID came from the allocator and goes back to it.
    owns_id: bool,
    registered: bool,
}

impl Registration {
    fn detach(&mut self) {
        if !self.registered {
            return;
        }
        let mut state = self.table.lock();
        state.slots[self.request_id as usize] = None;
        if self.owns_id {
            state.ids.release(self.request_id);
        }
        self.registered = false;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.detach();
    }
}

struct ActiveGuard {
    table: Arc<ActiveTable>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.table.active.send_modify(|n| *n -= 1);
    }
}

/// A checked-out, registered request processor.
///
/// Dropping it deregisters the ID, resets the processor into the pool, and
/// then decrements the active count, in that order.
pub struct ActiveRequest {
    registration: Registration,
    processor: Pooled<ProcessorManager>,
    _active: ActiveGuard,
}

impl ActiveRequest {
    #[inline]
    pub fn request_id(&self) -> u8 {
        self.registration.request_id
    }

    pub fn processor_mut(&mut self) -> &mut RequestProcessor {
        &mut self.processor
    }

    /// Route a packet to this call's stream.
    pub fn push_packet(&self, packet: PooledPacket) {
        self.processor.sink().push_packet(packet);
    }

    /// Send `request` and wait for the whole response.
    pub async fn invoke(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.processor.invoke(request).await
    }

    /// Make this call's pending or next read fail with `Disconnected`.
    pub fn stop_async(&self) {
        self.processor.sink().disconnect();
    }

    /// Remove the table entry early, before the processor is released.
    ///
    /// After this, inbound packets with this ID are no longer routed here.
    pub fn detach(&mut self) {
        self.registration.detach();
    }
}

impl std::fmt::Debug for ActiveRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveRequest")
            .field("request_id", &self.registration.request_id)
            .field("registered", &self.registration.registered)
            .finish()
    }
}
