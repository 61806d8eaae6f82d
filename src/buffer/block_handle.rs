//! Block handle - the shared descriptor for one block of managed memory.
//!
//! A [`BlockHandle`] tracks residency state, pin count, and identity for a
//! single logical block. Handles are shared (`Arc`) between callers, the
//! buffer manager, and the eviction queue (which holds only weak
//! references); when the last owner drops the handle, any backing swap
//! file is released.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use tracing::{debug, warn};

use crate::buffer::buffer_pool::BufferPool;
use crate::common::{BlockId, Error, MemoryTag, Result};
use crate::storage::TemporaryFileStore;

/// Residency of a block's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// No backing memory; previous contents (if any) were discarded.
    Unloaded,
    /// Backing memory is resident.
    Loaded,
    /// Contents live in the temporary file store.
    OnTempDisk,
}

/// Distinguishes normally managed blocks from small always-resident ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Evictable block that participates in the eviction queue.
    Managed,
    /// Small allocation that stays resident until the handle is dropped;
    /// unpinning never enqueues it.
    Small,
}

/// State guarded by the handle lock: residency plus the block's current
/// memory footprint.
struct Residency {
    state: BlockState,
    /// Bytes charged against the pool while the block is loaded.
    memory_usage: usize,
}

/// Reference-counted descriptor for one block of buffer-managed memory.
///
/// # Thread Safety
/// - `residency`: `Mutex` — every state transition happens under this lock
/// - `data`: `RwLock` — content access for pinned readers/writers
/// - `pin_count`: `AtomicU32` — mutated only under the residency lock, read
///   lock-free by the eviction queue's staleness check
/// - `eviction_seq`: `AtomicU64` — bumped under the residency lock on every
///   unpin that makes the block evictable
///
/// Lock order is `residency` before `data`; the eviction-queue lock is
/// never held across either.
///
/// Invariant: while the state is `Unloaded` or `OnTempDisk`, no eviction
/// queue entry carries this block's current sequence number. Eviction
/// consumes the matching entry before unloading, and re-pinning does not
/// create one, so a pin that holds this handle's lock while evicting other
/// blocks can never be handed its own block as a victim.
pub struct BlockHandle {
    block_id: BlockId,
    tag: MemoryTag,
    kind: BufferKind,
    can_destroy: bool,

    /// Number of live pins.
    pin_count: AtomicU32,

    /// Bumped every time the block becomes evictable.
    eviction_seq: AtomicU64,

    /// Residency state and memory footprint.
    residency: Mutex<Residency>,

    /// Backing bytes; `Some` exactly while the state is `Loaded`.
    data: RwLock<Option<Box<[u8]>>>,

    /// Pool charged for this block's resident memory.
    pool: Arc<BufferPool>,

    /// Swap store of the owning manager.
    temp: Arc<TemporaryFileStore>,
}

impl BlockHandle {
    /// Create a handle over freshly allocated, already-reserved memory.
    /// The block starts `Loaded` with a pin count of zero; it is invisible
    /// to the eviction queue until it has been pinned and unpinned once.
    pub(crate) fn new(
        block_id: BlockId,
        tag: MemoryTag,
        kind: BufferKind,
        can_destroy: bool,
        buffer: Box<[u8]>,
        pool: Arc<BufferPool>,
        temp: Arc<TemporaryFileStore>,
    ) -> Arc<Self> {
        let memory_usage = buffer.len();
        Arc::new(Self {
            block_id,
            tag,
            kind,
            can_destroy,
            pin_count: AtomicU32::new(0),
            eviction_seq: AtomicU64::new(0),
            residency: Mutex::new(Residency {
                state: BlockState::Loaded,
                memory_usage,
            }),
            data: RwLock::new(Some(buffer)),
            pool,
            temp,
        })
    }

    /// The block's identity.
    #[inline]
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// The accounting tag this block is charged under.
    #[inline]
    pub fn tag(&self) -> MemoryTag {
        self.tag
    }

    /// Whether eviction may discard this block's contents outright.
    #[inline]
    pub fn can_destroy(&self) -> bool {
        self.can_destroy
    }

    /// The block's buffer kind.
    #[inline]
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Current number of live pins.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Relaxed)
    }

    /// Current residency state.
    pub fn state(&self) -> BlockState {
        self.residency.lock().state
    }

    /// Current memory footprint in bytes (resident or not).
    pub fn memory_usage(&self) -> usize {
        self.residency.lock().memory_usage
    }

    #[inline]
    pub(crate) fn eviction_seq(&self) -> u64 {
        self.eviction_seq.load(Ordering::Relaxed)
    }

    /// Pin the block, materializing its memory if necessary.
    ///
    /// Fast path: the block is resident, so this is a lock, an increment,
    /// and no queue interaction. Cold path: memory is reserved against the
    /// pool (evicting other blocks as needed), then the contents are read
    /// back from the swap file (`OnTempDisk`) or a fresh zeroed buffer is
    /// allocated (`Unloaded`). The read happens on the calling thread.
    pub(crate) fn pin(&self) -> Result<()> {
        let mut residency = self.residency.lock();
        if residency.state == BlockState::Loaded {
            self.pin_count.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let size = residency.memory_usage;
        let reservation = self.pool.reserve(self.tag, size)?;
        let buffer = match residency.state {
            BlockState::OnTempDisk => {
                let buffer = self.temp.read_block(self.block_id)?;
                if let Err(e) = self.temp.delete_block(self.block_id) {
                    warn!(block_id = %self.block_id, error = %e,
                        "failed to delete temporary file after read-back");
                }
                buffer
            }
            BlockState::Unloaded => vec![0u8; size].into_boxed_slice(),
            BlockState::Loaded => unreachable!(),
        };
        *self.data.write() = Some(buffer);
        residency.state = BlockState::Loaded;
        reservation.commit();
        self.pin_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drop one pin. When the count reaches zero on a managed, loaded
    /// block, the block becomes evictable and is enqueued with a fresh
    /// sequence number.
    ///
    /// # Panics
    /// Panics if the pin count is already zero; an unmatched unpin is a
    /// caller bug, not a runtime condition.
    pub(crate) fn unpin(self: &Arc<Self>) {
        let residency = self.residency.lock();
        let prev = self.pin_count.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "pin count underflow on {}", self.block_id);
        if prev == 1 && self.kind == BufferKind::Managed && residency.state == BlockState::Loaded
        {
            self.verify_zero_readers();
            let seq = self.eviction_seq.fetch_add(1, Ordering::Relaxed) + 1;
            self.pool.queue().enqueue(Arc::downgrade(self), seq);
        }
    }

    /// Attempt to evict this block on behalf of a queue entry recorded at
    /// `expected_seq`. Returns the bytes reclaimed, or `None` if the block
    /// can no longer be evicted (it raced with a pin or a newer unpin).
    ///
    /// Non-destroyable blocks are written to the swap store first; if that
    /// write fails the block stays loaded and the error propagates.
    pub(crate) fn try_unload(&self, expected_seq: u64) -> Result<Option<usize>> {
        let mut residency = self.residency.lock();
        if self.pin_count.load(Ordering::Relaxed) != 0
            || self.eviction_seq.load(Ordering::Relaxed) != expected_seq
            || residency.state != BlockState::Loaded
        {
            return Ok(None);
        }

        let mut data = self.data.write();
        let Some(buffer) = data.take() else {
            return Ok(None);
        };
        if self.can_destroy {
            drop(buffer);
            residency.state = BlockState::Unloaded;
        } else {
            if let Err(e) = self.temp.write_block(self.tag, self.block_id, &buffer) {
                *data = Some(buffer);
                return Err(e);
            }
            residency.state = BlockState::OnTempDisk;
        }

        let freed = residency.memory_usage;
        self.pool.release_memory(self.tag, freed);
        debug!(block_id = %self.block_id, bytes = freed, destroyed = self.can_destroy,
            "evicted block");
        Ok(Some(freed))
    }

    /// Resize the block's backing memory in place (copy-and-replace).
    /// Only valid while the block is pinned; growth reserves the delta
    /// against the pool first, evicting as needed.
    pub(crate) fn resize(&self, new_size: usize) -> Result<()> {
        let mut residency = self.residency.lock();
        if self.pin_count.load(Ordering::Relaxed) == 0
            || residency.state != BlockState::Loaded
        {
            return Err(Error::InvalidState(format!(
                "cannot reallocate {}: block is not pinned",
                self.block_id
            )));
        }

        let old_size = residency.memory_usage;
        if new_size == old_size {
            return Ok(());
        }

        if new_size > old_size {
            let reservation = self.pool.reserve(self.tag, new_size - old_size)?;
            self.replace_buffer(new_size)?;
            reservation.commit();
        } else {
            self.replace_buffer(new_size)?;
            self.pool.release_memory(self.tag, old_size - new_size);
        }
        residency.memory_usage = new_size;
        Ok(())
    }

    /// Swap the backing buffer for one of `new_size` bytes, preserving the
    /// common prefix. Caller holds the residency lock.
    fn replace_buffer(&self, new_size: usize) -> Result<()> {
        let mut data = self.data.write();
        let Some(old) = data.take() else {
            return Err(Error::InvalidState(format!(
                "cannot reallocate {}: block has no resident buffer",
                self.block_id
            )));
        };
        let mut replacement = vec![0u8; new_size].into_boxed_slice();
        let keep = old.len().min(new_size);
        replacement[..keep].copy_from_slice(&old[..keep]);
        *data = Some(replacement);
        Ok(())
    }

    /// Zero-reader check, debug builds only: move the contents to a fresh
    /// allocation and poison the old one. A reader that kept a reference
    /// from a pin it already released observes the poison pattern instead
    /// of silently reading reused memory. Release builds compile this to
    /// nothing; the type system already scopes access to live pins.
    fn verify_zero_readers(&self) {
        #[cfg(debug_assertions)]
        {
            use crate::common::config::POISON_BYTE;

            let mut data = self.data.write();
            if let Some(mut old) = data.take() {
                let mut replacement = vec![0u8; old.len()].into_boxed_slice();
                replacement.copy_from_slice(&old);
                old.fill(POISON_BYTE);
                *data = Some(replacement);
            }
        }
    }

    /// Shared access to the resident bytes. Only reachable through a live
    /// pin ([`crate::buffer::BufferHandle`]).
    pub(crate) fn data_guard(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.data.read(), |data| match data {
            Some(buffer) => &buffer[..],
            None => panic!("{} accessed while not loaded", self.block_id),
        })
    }

    /// Exclusive access to the resident bytes. Only reachable through a
    /// live pin ([`crate::buffer::BufferHandle`]).
    pub(crate) fn data_guard_mut(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        RwLockWriteGuard::map(self.data.write(), |data| match data {
            Some(buffer) => &mut buffer[..],
            None => panic!("{} accessed while not loaded", self.block_id),
        })
    }
}

impl Drop for BlockHandle {
    fn drop(&mut self) {
        let residency = self.residency.get_mut();
        match residency.state {
            BlockState::Loaded => {
                self.pool.release_memory(self.tag, residency.memory_usage);
            }
            BlockState::OnTempDisk => {
                if let Err(e) = self.temp.delete_block(self.block_id) {
                    warn!(block_id = %self.block_id, error = %e,
                        "failed to delete temporary file for dropped block");
                }
            }
            BlockState::Unloaded => {}
        }
    }
}
