//! Buffer managers - the per-database entry point to the buffer layer.
//!
//! A [`StandardBufferManager`] wraps a shared [`BufferPool`] with
//! database-local policy: where temporary files go, how temporary block
//! ids are handed out, and per-database spill accounting. Several managers
//! (one per database instance) can share one pool.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::buffer::block_handle::{BlockHandle, BufferKind};
use crate::buffer::buffer_handle::BufferHandle;
use crate::buffer::buffer_pool::{BufferPool, MemoryInformation};
use crate::common::{BlockId, MemoryTag, Result};
use crate::storage::{TemporaryFileInformation, TemporaryFileStore};

/// The operation set every buffer manager implementation exposes.
///
/// [`StandardBufferManager`] is the standard implementation; alternates
/// (e.g. a strictly in-memory variant) plug in behind this trait and are
/// selected at construction.
pub trait BufferManager: Send + Sync {
    /// Create a new block without pinning it.
    ///
    /// `can_destroy = true` lets eviction drop the contents outright
    /// (recomputable data); `false` forces eviction to preserve them in
    /// the temporary file store.
    ///
    /// A block that is never pinned is never added to the eviction queue
    /// and is therefore invisible to memory pressure — callers must pin at
    /// least once.
    fn register_memory(
        &self,
        tag: MemoryTag,
        size: usize,
        can_destroy: bool,
    ) -> Result<Arc<BlockHandle>>;

    /// Register a small always-resident block. Unpinning never makes it an
    /// eviction candidate; its memory is released when the handle drops.
    fn register_small_memory(&self, tag: MemoryTag, size: usize) -> Result<Arc<BlockHandle>>;

    /// Register a block and immediately pin it.
    ///
    /// Fails with an out-of-memory error if the reservation cannot be
    /// satisfied even after full eviction.
    fn allocate(&self, tag: MemoryTag, size: usize, can_destroy: bool) -> Result<BufferHandle>;

    /// Resize a block's backing memory. Only valid while the block is
    /// currently pinned; growth may evict other blocks.
    fn reallocate(&self, handle: &Arc<BlockHandle>, new_size: usize) -> Result<()>;

    /// Pin a block, materializing its memory if it was evicted. Blocks the
    /// calling thread for any required swap-file read.
    fn pin(&self, handle: &Arc<BlockHandle>) -> Result<BufferHandle>;

    /// Drop one pin without going through a [`BufferHandle`].
    fn unpin(&self, handle: &Arc<BlockHandle>);

    /// Account scratch memory against the pool with no block attached,
    /// evicting as needed. Balanced by [`BufferManager::free_reserved_memory`].
    fn reserve_memory(&self, size: usize) -> Result<()>;

    /// Release scratch memory taken via [`BufferManager::reserve_memory`].
    fn free_reserved_memory(&self, size: usize);

    /// Bytes currently charged against the shared pool.
    fn used_memory(&self) -> usize;

    /// The pool's memory ceiling, or `None` if unlimited.
    fn max_memory(&self) -> Option<usize>;

    /// Bytes of swap space this manager currently occupies.
    fn used_swap(&self) -> u64;

    /// This manager's swap ceiling, or `None` if unlimited.
    fn max_swap(&self) -> Option<u64>;

    /// Per-tag breakdown of resident and evicted bytes.
    fn memory_usage_info(&self) -> Vec<MemoryInformation>;

    /// All active swap files of this manager.
    fn temporary_files(&self) -> Vec<TemporaryFileInformation>;

    /// True if a temporary directory is configured (spilling enabled).
    fn has_temporary_directory(&self) -> bool;

    /// The configured temporary directory, if any.
    fn temporary_directory(&self) -> Option<PathBuf>;

    /// Point the manager at a new temporary directory. Rejected once
    /// spilled files exist under the old one.
    fn set_temporary_directory(&self, path: PathBuf) -> Result<()>;

    /// Change the shared pool's memory ceiling; see
    /// [`BufferPool::set_memory_limit`].
    fn set_memory_limit(&self, limit: Option<usize>) -> Result<()>;

    /// Change this manager's swap ceiling. `None` means unlimited.
    fn set_swap_limit(&self, limit: Option<u64>) -> Result<()>;

    /// Garbage-collect stale entries from the shared eviction queue.
    fn purge_queue(&self);

    /// The shared pool this manager registers its memory with.
    fn buffer_pool(&self) -> &Arc<BufferPool>;
}

/// The standard buffer manager: shared-pool budgeting plus spill-to-disk.
///
/// # Usage
/// ```ignore
/// let pool = BufferPool::new(Some(1 << 30));
/// let manager = StandardBufferManager::new(pool, Some("/tmp/oxbow_swap".into()));
///
/// let handle = manager.allocate(MemoryTag::OrderBy, 1 << 20, false)?;
/// handle.data_mut()[0] = 0xAB;
/// let block = Arc::clone(handle.block());
/// drop(handle); // unpinned: may now be spilled under pressure
///
/// let handle = manager.pin(&block)?; // transparently read back
/// ```
pub struct StandardBufferManager {
    /// The shared memory budget.
    pool: Arc<BufferPool>,

    /// Swap storage for this manager's evicted blocks.
    temp: Arc<TemporaryFileStore>,

    /// Magnitude of the next temporary block id.
    next_temporary_id: AtomicI64,
}

impl StandardBufferManager {
    /// Create a manager on `pool`. `temp_directory = None` disables
    /// spilling: blocks registered with `can_destroy = false` then fail
    /// eviction with a configuration error.
    pub fn new(pool: Arc<BufferPool>, temp_directory: Option<PathBuf>) -> Self {
        Self {
            pool,
            temp: Arc::new(TemporaryFileStore::new(temp_directory)),
            next_temporary_id: AtomicI64::new(1),
        }
    }

    /// Hand out the next temporary block id (negative, monotonic).
    fn new_temporary_id(&self) -> BlockId {
        let n = self.next_temporary_id.fetch_add(1, Ordering::Relaxed);
        BlockId::new(-n)
    }

    fn register(
        &self,
        tag: MemoryTag,
        size: usize,
        kind: BufferKind,
        can_destroy: bool,
    ) -> Result<Arc<BlockHandle>> {
        let reservation = self.pool.reserve(tag, size)?;
        let buffer = vec![0u8; size].into_boxed_slice();
        let handle = BlockHandle::new(
            self.new_temporary_id(),
            tag,
            kind,
            can_destroy,
            buffer,
            Arc::clone(&self.pool),
            Arc::clone(&self.temp),
        );
        reservation.commit();
        Ok(handle)
    }

    /// Write a block's raw bytes to this manager's temporary file store.
    pub fn write_temporary_buffer(
        &self,
        tag: MemoryTag,
        block_id: BlockId,
        buffer: &[u8],
    ) -> Result<()> {
        self.temp.write_block(tag, block_id, buffer)
    }

    /// Read a block's raw bytes back from the temporary file store.
    pub fn read_temporary_buffer(&self, block_id: BlockId) -> Result<Box<[u8]>> {
        self.temp.read_block(block_id)
    }

    /// Release a block's swap file, if it has one.
    pub fn delete_temporary_file(&self, block_id: BlockId) -> Result<()> {
        self.temp.delete_block(block_id)
    }
}

impl BufferManager for StandardBufferManager {
    fn register_memory(
        &self,
        tag: MemoryTag,
        size: usize,
        can_destroy: bool,
    ) -> Result<Arc<BlockHandle>> {
        self.register(tag, size, BufferKind::Managed, can_destroy)
    }

    fn register_small_memory(&self, tag: MemoryTag, size: usize) -> Result<Arc<BlockHandle>> {
        self.register(tag, size, BufferKind::Small, false)
    }

    fn allocate(&self, tag: MemoryTag, size: usize, can_destroy: bool) -> Result<BufferHandle> {
        let handle = self.register_memory(tag, size, can_destroy)?;
        self.pin(&handle)
    }

    fn reallocate(&self, handle: &Arc<BlockHandle>, new_size: usize) -> Result<()> {
        handle.resize(new_size)
    }

    fn pin(&self, handle: &Arc<BlockHandle>) -> Result<BufferHandle> {
        handle.pin()?;
        Ok(BufferHandle::new(Arc::clone(handle)))
    }

    fn unpin(&self, handle: &Arc<BlockHandle>) {
        handle.unpin();
    }

    fn reserve_memory(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let reservation = self.pool.reserve(MemoryTag::Allocator, size)?;
        reservation.commit();
        Ok(())
    }

    fn free_reserved_memory(&self, size: usize) {
        if size == 0 {
            return;
        }
        self.pool.release_memory(MemoryTag::Allocator, size);
    }

    fn used_memory(&self) -> usize {
        self.pool.used_memory()
    }

    fn max_memory(&self) -> Option<usize> {
        self.pool.max_memory()
    }

    fn used_swap(&self) -> u64 {
        self.temp.size_on_disk()
    }

    fn max_swap(&self) -> Option<u64> {
        self.temp.max_swap_space()
    }

    fn memory_usage_info(&self) -> Vec<MemoryInformation> {
        MemoryTag::ALL
            .iter()
            .map(|&tag| MemoryInformation {
                tag,
                size: self.pool.used_by_tag(tag) as u64,
                evicted: self.temp.evicted_by_tag(tag),
            })
            .collect()
    }

    fn temporary_files(&self) -> Vec<TemporaryFileInformation> {
        self.temp.temporary_files()
    }

    fn has_temporary_directory(&self) -> bool {
        self.temp.has_directory()
    }

    fn temporary_directory(&self) -> Option<PathBuf> {
        self.temp.directory()
    }

    fn set_temporary_directory(&self, path: PathBuf) -> Result<()> {
        self.temp.set_directory(path)
    }

    fn set_memory_limit(&self, limit: Option<usize>) -> Result<()> {
        self.pool.set_memory_limit(limit)
    }

    fn set_swap_limit(&self, limit: Option<u64>) -> Result<()> {
        self.temp.set_max_swap_space(limit)
    }

    fn purge_queue(&self) {
        self.pool.purge_queue();
    }

    fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}
