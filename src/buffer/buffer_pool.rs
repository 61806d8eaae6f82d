//! Buffer pool - the shared memory budget.
//!
//! One [`BufferPool`] enforces a global memory ceiling for every buffer
//! manager registered with it, owns the eviction queue, and runs the
//! eviction loop when a reservation pushes usage over the limit.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::buffer::eviction_queue::EvictionQueue;
use crate::common::{Error, MemoryTag, Result};

/// Per-tag memory breakdown returned by usage queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInformation {
    pub tag: MemoryTag,
    /// Resident bytes charged under this tag.
    pub size: u64,
    /// Bytes currently evicted to temporary storage under this tag.
    pub evicted: u64,
}

/// The shared memory budget for one or more buffer managers.
///
/// # Architecture
/// ```text
/// ┌────────────────────────────────────────────────────────────┐
/// │                        BufferPool                          │
/// │  ┌───────────────────┐   ┌─────────────────────────────┐  │
/// │  │ memory_used       │   │       EvictionQueue         │  │
/// │  │ memory_reserved   │──▶│ (Weak<BlockHandle>, seq) …  │  │
/// │  │ used_per_tag[]    │   └─────────────────────────────┘  │
/// │  └───────────────────┘                                    │
/// └────────────────────────────────────────────────────────────┘
///        ▲                  ▲                     ▲
///   manager A          manager B            manager C
/// ```
///
/// # Thread Safety
/// - usage counters: atomics, updated through [`MemoryReservation`]
/// - `queue`: internally synchronized; see `eviction_queue.rs`
/// - `limit_lock`: serializes memory-limit changes
///
/// Reservation is optimistic: usage is increased first, eviction runs if
/// the result exceeds the limit, and the increase rolls back if eviction
/// cannot catch up. A transient overshoot during that window is expected;
/// a permanent one after a failed reservation is not.
pub struct BufferPool {
    /// Memory ceiling in bytes; `usize::MAX` means unlimited.
    maximum_memory: AtomicUsize,

    /// Bytes currently charged: resident blocks plus in-flight
    /// reservations.
    memory_used: AtomicUsize,

    /// Bytes reserved but not yet committed to a loaded block.
    memory_reserved: AtomicUsize,

    /// Resident bytes per tag.
    used_per_tag: [AtomicUsize; MemoryTag::COUNT],

    /// Eviction candidates, shared by all managers on this pool.
    queue: EvictionQueue,

    /// Serializes `set_memory_limit`.
    limit_lock: Mutex<()>,

    /// Number of successful evictions.
    evictions: AtomicU64,
}

impl BufferPool {
    /// Create a pool with the given memory ceiling. `None` means
    /// unlimited. Counters are scoped to this pool instance; pools share
    /// no state unless explicitly wired together.
    pub fn new(maximum_memory: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            maximum_memory: AtomicUsize::new(maximum_memory.unwrap_or(usize::MAX)),
            memory_used: AtomicUsize::new(0),
            memory_reserved: AtomicUsize::new(0),
            used_per_tag: [const { AtomicUsize::new(0) }; MemoryTag::COUNT],
            queue: EvictionQueue::new(),
            limit_lock: Mutex::new(()),
            evictions: AtomicU64::new(0),
        })
    }

    /// Bytes currently charged against the pool.
    pub fn used_memory(&self) -> usize {
        self.memory_used.load(Ordering::Relaxed)
    }

    /// Bytes reserved but not yet backing a loaded block.
    pub fn reserved_memory(&self) -> usize {
        self.memory_reserved.load(Ordering::Relaxed)
    }

    /// The memory ceiling, or `None` if unlimited.
    pub fn max_memory(&self) -> Option<usize> {
        match self.maximum_memory.load(Ordering::Relaxed) {
            usize::MAX => None,
            limit => Some(limit),
        }
    }

    /// Resident bytes charged under one tag.
    pub fn used_by_tag(&self, tag: MemoryTag) -> usize {
        self.used_per_tag[tag.index()].load(Ordering::Relaxed)
    }

    /// Number of successful evictions since the pool was created.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Entries currently in the eviction queue, stale ones included.
    pub fn eviction_queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Run one bounded purge sweep over the eviction queue.
    pub fn purge_queue(&self) {
        self.queue.purge();
    }

    pub(crate) fn queue(&self) -> &EvictionQueue {
        &self.queue
    }

    /// Reserve `size` bytes under `tag`, evicting blocks as needed.
    ///
    /// On success the returned reservation must be committed once the
    /// memory actually backs a loaded block; dropping it uncommitted rolls
    /// the charge back. Fails with [`Error::OutOfMemory`] when the
    /// eviction queue is exhausted and usage still exceeds the limit, or
    /// with [`Error::Io`]/[`Error::Configuration`] if evicting a victim
    /// required a spill that could not be performed.
    pub(crate) fn reserve(
        self: &Arc<Self>,
        tag: MemoryTag,
        size: usize,
    ) -> Result<MemoryReservation> {
        let reservation = MemoryReservation::new(Arc::clone(self), tag, size);
        loop {
            let limit = self.maximum_memory.load(Ordering::Relaxed);
            if self.memory_used.load(Ordering::Relaxed) <= limit {
                return Ok(reservation);
            }
            match self.queue.try_evict_next() {
                Ok(Some(_)) => {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => {
                    let used = self.memory_used.load(Ordering::Relaxed).saturating_sub(size);
                    drop(reservation);
                    return Err(Error::OutOfMemory {
                        reason: format!("failed to reserve {} bytes", size),
                        used,
                        limit,
                    });
                }
                Err(e) => {
                    drop(reservation);
                    return Err(e);
                }
            }
        }
    }

    /// Return committed memory to the pool when a block is unloaded,
    /// shrunk, or dropped.
    pub(crate) fn release_memory(&self, tag: MemoryTag, size: usize) {
        self.memory_used.fetch_sub(size, Ordering::Relaxed);
        self.used_per_tag[tag.index()].fetch_sub(size, Ordering::Relaxed);
    }

    /// Change the memory ceiling. `None` means unlimited.
    ///
    /// Evicts down to the new ceiling before publishing it. If eviction
    /// cannot bring usage under the ceiling (too much pinned memory), the
    /// limit is left unchanged and [`Error::OutOfMemory`] is returned.
    pub fn set_memory_limit(&self, limit: Option<usize>) -> Result<()> {
        let _guard = self.limit_lock.lock();
        let new = limit.unwrap_or(usize::MAX);
        while self.memory_used.load(Ordering::Relaxed) > new {
            match self.queue.try_evict_next()? {
                Some(_) => {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    return Err(Error::OutOfMemory {
                        reason: format!(
                            "cannot set memory limit to {} bytes: remaining blocks are pinned",
                            new
                        ),
                        used: self.memory_used.load(Ordering::Relaxed),
                        limit: new,
                    });
                }
            }
        }
        self.maximum_memory.store(new, Ordering::Relaxed);
        info!(limit = ?limit, "memory limit updated");
        Ok(())
    }
}

/// RAII charge against a pool's budget.
///
/// Created by [`BufferPool::reserve`]; the bytes count as used from that
/// moment. [`MemoryReservation::commit`] converts the charge into resident
/// memory under the reservation's tag; dropping an uncommitted reservation
/// rolls the charge back entirely.
pub(crate) struct MemoryReservation {
    pool: Arc<BufferPool>,
    tag: MemoryTag,
    size: usize,
}

impl std::fmt::Debug for MemoryReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReservation")
            .field("tag", &self.tag)
            .field("size", &self.size)
            .finish()
    }
}

impl MemoryReservation {
    fn new(pool: Arc<BufferPool>, tag: MemoryTag, size: usize) -> Self {
        pool.memory_used.fetch_add(size, Ordering::Relaxed);
        pool.memory_reserved.fetch_add(size, Ordering::Relaxed);
        Self { pool, tag, size }
    }

    /// The reserved memory now backs a loaded block: move it from the
    /// reserved gauge to the tag's resident counter.
    pub fn commit(mut self) {
        self.pool.memory_reserved.fetch_sub(self.size, Ordering::Relaxed);
        self.pool.used_per_tag[self.tag.index()].fetch_add(self.size, Ordering::Relaxed);
        self.size = 0;
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        if self.size > 0 {
            self.pool.memory_used.fetch_sub(self.size, Ordering::Relaxed);
            self.pool.memory_reserved.fetch_sub(self.size, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::block_handle::{BlockHandle, BlockState, BufferKind};
    use crate::common::BlockId;
    use crate::storage::TemporaryFileStore;

    fn register_block(
        pool: &Arc<BufferPool>,
        temp: &Arc<TemporaryFileStore>,
        id: i64,
        size: usize,
        can_destroy: bool,
    ) -> Arc<BlockHandle> {
        let reservation = pool.reserve(MemoryTag::OrderBy, size).unwrap();
        let handle = BlockHandle::new(
            BlockId::new(id),
            MemoryTag::OrderBy,
            BufferKind::Managed,
            can_destroy,
            vec![0u8; size].into_boxed_slice(),
            Arc::clone(pool),
            Arc::clone(temp),
        );
        reservation.commit();
        handle
    }

    #[test]
    fn test_reservation_commit_and_rollback() {
        let pool = BufferPool::new(Some(100));

        let reservation = pool.reserve(MemoryTag::HashTable, 40).unwrap();
        assert_eq!(pool.used_memory(), 40);
        assert_eq!(pool.reserved_memory(), 40);
        assert_eq!(pool.used_by_tag(MemoryTag::HashTable), 0);

        reservation.commit();
        assert_eq!(pool.used_memory(), 40);
        assert_eq!(pool.reserved_memory(), 0);
        assert_eq!(pool.used_by_tag(MemoryTag::HashTable), 40);

        let reservation = pool.reserve(MemoryTag::HashTable, 40).unwrap();
        drop(reservation);
        assert_eq!(pool.used_memory(), 40);
        assert_eq!(pool.reserved_memory(), 0);
    }

    #[test]
    fn test_reserve_fails_with_nothing_to_evict() {
        let pool = BufferPool::new(Some(100));
        let err = pool.reserve(MemoryTag::OrderBy, 200).unwrap_err();
        assert!(err.is_out_of_memory());
        // failed reservation must not leave a permanent overcommit
        assert_eq!(pool.used_memory(), 0);
        assert_eq!(pool.reserved_memory(), 0);
    }

    #[test]
    fn test_reserve_evicts_unpinned_block() {
        let pool = BufferPool::new(Some(100));
        let temp = Arc::new(TemporaryFileStore::new(None));

        let block = register_block(&pool, &temp, -1, 80, true);
        block.pin().unwrap();
        block.unpin();
        assert_eq!(pool.used_memory(), 80);

        let reservation = pool.reserve(MemoryTag::OrderBy, 60).unwrap();
        reservation.commit();
        assert_eq!(block.state(), BlockState::Unloaded);
        assert_eq!(pool.used_memory(), 60);
        assert_eq!(pool.evictions(), 1);
    }

    #[test]
    fn test_reserve_fails_when_blocks_pinned() {
        let pool = BufferPool::new(Some(100));
        let temp = Arc::new(TemporaryFileStore::new(None));

        let block = register_block(&pool, &temp, -1, 80, true);
        block.pin().unwrap();

        let err = pool.reserve(MemoryTag::OrderBy, 60).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(pool.used_memory(), 80);
        block.unpin();
    }

    #[test]
    fn test_set_memory_limit_evicts_down() {
        let pool = BufferPool::new(Some(100));
        let temp = Arc::new(TemporaryFileStore::new(None));

        let block = register_block(&pool, &temp, -1, 80, true);
        block.pin().unwrap();
        block.unpin();

        pool.set_memory_limit(Some(40)).unwrap();
        assert_eq!(pool.max_memory(), Some(40));
        assert_eq!(block.state(), BlockState::Unloaded);
        assert_eq!(pool.used_memory(), 0);
    }

    #[test]
    fn test_set_memory_limit_below_pinned_rejected() {
        let pool = BufferPool::new(Some(100));
        let temp = Arc::new(TemporaryFileStore::new(None));

        let block = register_block(&pool, &temp, -1, 80, true);
        block.pin().unwrap();

        let err = pool.set_memory_limit(Some(40)).unwrap_err();
        assert!(err.is_out_of_memory());
        // limit unchanged, block untouched
        assert_eq!(pool.max_memory(), Some(100));
        assert_eq!(block.state(), BlockState::Loaded);
        assert_eq!(pool.used_memory(), 80);
        block.unpin();
    }

    #[test]
    fn test_set_memory_limit_unlimited_always_succeeds() {
        let pool = BufferPool::new(Some(10));
        let temp = Arc::new(TemporaryFileStore::new(None));
        let block = register_block(&pool, &temp, -1, 10, true);
        block.pin().unwrap();

        pool.set_memory_limit(None).unwrap();
        assert_eq!(pool.max_memory(), None);
        block.unpin();
    }

    #[test]
    fn test_purge_drops_stale_entries() {
        let pool = BufferPool::new(None);
        let temp = Arc::new(TemporaryFileStore::new(None));
        let block = register_block(&pool, &temp, -1, 8, true);

        // every cycle leaves one more entry; all but the last are stale
        for _ in 0..50 {
            block.pin().unwrap();
            block.unpin();
        }
        assert_eq!(pool.eviction_queue_len(), 50);

        pool.purge_queue();
        assert_eq!(pool.eviction_queue_len(), 1);

        // the surviving entry must still evict the block
        assert_eq!(pool.queue().try_evict_next().unwrap(), Some(8));
        assert_eq!(block.state(), BlockState::Unloaded);
    }

    #[test]
    fn test_dead_blocks_are_skipped() {
        let pool = BufferPool::new(None);
        let temp = Arc::new(TemporaryFileStore::new(None));

        let block = register_block(&pool, &temp, -1, 8, true);
        block.pin().unwrap();
        block.unpin();
        drop(block);

        assert_eq!(pool.eviction_queue_len(), 1);
        assert_eq!(pool.queue().try_evict_next().unwrap(), None);
        assert_eq!(pool.eviction_queue_len(), 0);
    }

    #[test]
    fn test_pools_share_no_state() {
        let a = BufferPool::new(Some(100));
        let b = BufferPool::new(Some(100));

        let reservation = a.reserve(MemoryTag::OrderBy, 50).unwrap();
        reservation.commit();
        assert_eq!(a.used_memory(), 50);
        assert_eq!(b.used_memory(), 0);
        a.release_memory(MemoryTag::OrderBy, 50);
    }
}
