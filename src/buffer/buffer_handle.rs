//! RAII pin token for block access.
//!
//! A [`BufferHandle`] is returned by a successful pin and is the only path
//! to a block's memory. Dropping it (or calling [`BufferHandle::release`])
//! unpins the block.

use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard};

use crate::buffer::block_handle::BlockHandle;
use crate::common::BlockId;

/// Exclusive owner of one pin on one block.
///
/// Not `Clone`: each pin is matched by exactly one unpin, performed when
/// this token drops. Re-pinning the same block goes through the buffer
/// manager and yields a new token.
///
/// # Example
/// ```ignore
/// let handle = manager.allocate(MemoryTag::OrderBy, 1024, true)?;
/// handle.data_mut()[0] = 0xAB;
/// // handle drops here: block unpinned, eligible for eviction
/// ```
pub struct BufferHandle {
    block: Arc<BlockHandle>,
}

impl BufferHandle {
    /// Called by the buffer manager after a successful pin.
    pub(crate) fn new(block: Arc<BlockHandle>) -> Self {
        Self { block }
    }

    /// The pinned block. Cloning the returned `Arc` keeps the block alive
    /// but does not keep it pinned.
    #[inline]
    pub fn block(&self) -> &Arc<BlockHandle> {
        &self.block
    }

    /// The pinned block's identity.
    #[inline]
    pub fn block_id(&self) -> BlockId {
        self.block.block_id()
    }

    /// Size of the pinned memory in bytes.
    pub fn len(&self) -> usize {
        self.block.memory_usage()
    }

    /// True if the pinned memory is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared access to the pinned bytes.
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        self.block.data_guard()
    }

    /// Exclusive access to the pinned bytes.
    pub fn data_mut(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        self.block.data_guard_mut()
    }

    /// Explicitly unpin. Equivalent to dropping the handle; provided for
    /// call sites where the release should be visible in the code.
    pub fn release(self) {}
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("block_id", &self.block_id())
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.block.unpin();
    }
}
