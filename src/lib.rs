//! OxbowDB buffer layer - bounded memory management with spill-to-disk.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     database instances                          │
//! │        (query execution, sorting, hashing, caching)             │
//! └───────────────┬───────────────────────────┬─────────────────────┘
//!                 ↓                           ↓
//! ┌───────────────────────────┐ ┌───────────────────────────┐
//! │  StandardBufferManager A  │ │  StandardBufferManager B  │
//! │  allocate / pin / unpin   │ │                           │
//! │  TemporaryFileStore ──────┼─┼── TemporaryFileStore      │
//! └─────────────┬─────────────┘ └─────────────┬─────────────┘
//!               ↓                             ↓
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          BufferPool                             │
//! │   memory budget + eviction queue (shared by all managers)       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Callers ask a manager to allocate or register blocks; the manager
//! reserves memory from the shared pool, evicting unpinned blocks when the
//! budget is exceeded. Evicted blocks are either discarded (destroyable)
//! or spilled to the manager's temporary file store and read back
//! transparently on the next pin.
//!
//! # Modules
//! - [`common`] - Shared primitives (BlockId, MemoryTag, Error, config)
//! - [`buffer`] - Block handles, pin tokens, the pool, and the managers
//! - [`storage`] - Temporary swap-file store
//!
//! # Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use oxbowdb_buffer::{BufferManager, BufferPool, MemoryTag, StandardBufferManager};
//!
//! // 1 GiB budget shared by every manager on this pool
//! let pool = BufferPool::new(Some(1 << 30));
//! let manager = StandardBufferManager::new(pool, Some("/tmp/oxbow_swap".into()));
//!
//! // Allocate a pinned scratch block; contents survive eviction because
//! // can_destroy is false.
//! let handle = manager.allocate(MemoryTag::OrderBy, 1 << 20, false).unwrap();
//! handle.data_mut()[0] = 0xAB;
//!
//! // Keep the block, release the pin: the block may now be spilled.
//! let block = Arc::clone(handle.block());
//! drop(handle);
//!
//! // Pinning again reads the contents back if they were spilled.
//! let handle = manager.pin(&block).unwrap();
//! assert_eq!(handle.data()[0], 0xAB);
//! ```

// Core modules
pub mod buffer;
pub mod common;
pub mod storage;

// Re-export commonly used items at crate root for convenience
pub use buffer::{
    BlockHandle, BlockState, BufferHandle, BufferKind, BufferManager, BufferPool,
    MemoryInformation, StandardBufferManager,
};
pub use common::{BlockId, Error, MemoryTag, Result};
pub use storage::{TemporaryFileInformation, TemporaryFileStore};
