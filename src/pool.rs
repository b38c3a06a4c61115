//! Bounded, blocking object pool.
//!
//! Entries are created on demand up to the pool capacity and recycled
//! afterwards. `acquire` waits while every entry is checked out; the returned
//! [`Pooled`] guard resets its entry and hands it back exactly once, when it
//! is dropped.
//!
//! ```text
//! acquire ─► Semaphore permit ─► idle list (or create) ─► Pooled<M>
//!                                        ▲                    │
//!                                        └──── reset ◄── drop ┘
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{MuxError, Result};
use crate::protocol::Packet;

/// Creates and recycles the entries of a [`Pool`].
pub trait PoolManager: Send + Sync + 'static {
    type Entry: Send + 'static;

    /// Build a fresh entry. Called at most `capacity` times per pool.
    fn create(&self) -> Self::Entry;

    /// Return an entry to its initial state before it goes back on the idle list.
    fn reset(&self, entry: &mut Self::Entry);
}

struct PoolInner<M: PoolManager> {
    manager: M,
    idle: Mutex<Vec<M::Entry>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl<M: PoolManager> PoolInner<M> {
    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<M::Entry>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A pool of at most `capacity` entries. Cheap to clone.
pub struct Pool<M: PoolManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: PoolManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: PoolManager> Pool<M> {
    pub fn new(capacity: usize, manager: M) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                manager,
                idle: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
            }),
        }
    }

    /// Check out an entry, waiting while the pool is exhausted.
    pub async fn acquire(&self) -> Result<Pooled<M>> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MuxError::Disconnected)?;
        Ok(self.checkout(permit))
    }

    /// Check out an entry, giving up after `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Option<Pooled<M>> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .ok()
            .and_then(|r| r.ok())
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> Pooled<M> {
        let recycled = self.inner.idle().pop();
        let entry = recycled.unwrap_or_else(|| self.inner.manager.create());
        Pooled {
            entry: Some(entry),
            pool: self.inner.clone(),
            _permit: permit,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Entries currently checked out.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.inner.capacity - self.inner.permits.available_permits()
    }
}

/// A checked-out entry. Returns to its pool on drop.
pub struct Pooled<M: PoolManager> {
    entry: Option<M::Entry>,
    pool: Arc<PoolInner<M>>,
    // Dropped after `Drop::drop` has pushed the entry back.
    _permit: OwnedSemaphorePermit,
}

impl<M: PoolManager> Deref for Pooled<M> {
    type Target = M::Entry;

    fn deref(&self) -> &Self::Target {
        self.entry.as_ref().expect("pooled entry is present until drop")
    }
}

impl<M: PoolManager> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.entry.as_mut().expect("pooled entry is present until drop")
    }
}

impl<M: PoolManager> Drop for Pooled<M> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entry.take() {
            self.pool.manager.reset(&mut entry);
            self.pool.idle().push(entry);
        }
    }
}

impl<M: PoolManager> std::fmt::Debug for Pooled<M>
where
    M::Entry: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pooled").field(&self.entry).finish()
    }
}

/// Builds fixed-capacity packets.
#[derive(Debug, Clone, Copy)]
pub struct PacketManager {
    packet_capacity: usize,
}

impl PacketManager {
    pub fn new(packet_capacity: usize) -> Self {
        Self { packet_capacity }
    }
}

impl PoolManager for PacketManager {
    type Entry = Packet;

    fn create(&self) -> Packet {
        Packet::with_capacity(self.packet_capacity)
    }

    fn reset(&self, packet: &mut Packet) {
        packet.reset();
    }
}

/// Pool shared by every reader, writer and request processor of a connection.
pub type PacketPool = Pool<PacketManager>;

/// A packet checked out of a [`PacketPool`].
pub type PooledPacket = Pooled<PacketManager>;

/// Create a packet pool holding at most `max_packets` packets of `packet_capacity` bytes.
pub fn packet_pool(max_packets: usize, packet_capacity: usize) -> PacketPool {
    Pool::new(max_packets, PacketManager::new(packet_capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        created: Arc<AtomicUsize>,
    }

    impl PoolManager for Counting {
        type Entry = Vec<u32>;

        fn create(&self) -> Vec<u32> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }

        fn reset(&self, entry: &mut Vec<u32>) {
            entry.clear();
        }
    }

    fn counting_pool(capacity: usize) -> (Pool<Counting>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(
            capacity,
            Counting {
                created: created.clone(),
            },
        );
        (pool, created)
    }

    #[tokio::test]
    async fn test_entries_are_reused_and_reset() {
        let (pool, created) = counting_pool(2);

        {
            let mut entry = pool.acquire().await.unwrap();
            entry.push(7);
            assert_eq!(pool.in_use(), 1);
        }

        assert_eq!(pool.in_use(), 0);

        let entry = pool.acquire().await.unwrap();
        assert!(entry.is_empty());
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_created_on_demand() {
        let (pool, created) = counting_pool(10);
        assert_eq!(created.load(Ordering::SeqCst), 0);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.in_use(), 2);
        drop((a, b));

        let _c = pool.acquire().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let (pool, _) = counting_pool(1);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_acquire_timeout_expires() {
        let (pool, _) = counting_pool(1);
        let _held = pool.acquire().await.unwrap();

        let result = pool.acquire_timeout(Duration::from_millis(20)).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_packet_pool_resets_packets() {
        let pool = packet_pool(4, 128);
        {
            let mut packet = pool.acquire().await.unwrap();
            packet.set_request_id(42);
            packet.write_data(b"stale");
        }

        let packet = pool.acquire().await.unwrap();
        assert_eq!(packet.request_id(), 0);
        assert!(packet.is_empty());
        assert_eq!(packet.capacity(), 128);
    }
}
