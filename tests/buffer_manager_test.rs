//! Buffer Manager Tests
//!
//! End-to-end tests of the allocate/pin/unpin/spill lifecycle through the
//! public `BufferManager` interface.

use std::path::PathBuf;
use std::sync::Arc;

use oxbowdb_buffer::{
    BlockState, BufferManager, BufferPool, Error, MemoryTag, StandardBufferManager,
};
use tempfile::tempdir;

fn create_manager(
    limit: Option<usize>,
) -> (Arc<StandardBufferManager>, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let pool = BufferPool::new(limit);
    let manager = StandardBufferManager::new(pool, Some(dir.path().join("swap")));
    (Arc::new(manager), dir)
}

/// Fill a pinned block with a repeating marker byte.
fn fill(handle: &oxbowdb_buffer::BufferHandle, marker: u8) {
    handle.data_mut().fill(marker);
}

/// Assert every byte of a pinned block equals the marker.
fn assert_filled(handle: &oxbowdb_buffer::BufferHandle, marker: u8) {
    assert!(handle.data().iter().all(|&b| b == marker));
}

// ============================================================================
// Basic lifecycle
// ============================================================================

#[test]
fn test_allocate_write_read() {
    let (manager, _dir) = create_manager(None);

    let handle = manager.allocate(MemoryTag::ColumnData, 512, true).unwrap();
    fill(&handle, 0x42);
    assert_filled(&handle, 0x42);
    assert_eq!(handle.len(), 512);

    // the token owns the only reference: dropping it destroys the block
    // and returns its memory to the pool
    drop(handle);
    assert_eq!(manager.used_memory(), 0);
}

#[test]
fn test_repin_resident_block_preserves_contents() {
    let (manager, _dir) = create_manager(None);

    let handle = manager.allocate(MemoryTag::ColumnData, 64, true).unwrap();
    fill(&handle, 0x17);
    let block = Arc::clone(handle.block());
    drop(handle);

    // no memory pressure occurred: contents still resident
    let handle = manager.pin(&block).unwrap();
    assert_filled(&handle, 0x17);
}

#[test]
fn test_multiple_pins_same_block() {
    let (manager, _dir) = create_manager(None);

    let first = manager.allocate(MemoryTag::ColumnData, 64, true).unwrap();
    let block = Arc::clone(first.block());
    let second = manager.pin(&block).unwrap();

    assert_eq!(block.pin_count(), 2);
    drop(first);
    assert_eq!(block.pin_count(), 1);
    second.release();
    assert_eq!(block.pin_count(), 0);
}

// ============================================================================
// Spill round-trips
// ============================================================================

#[test]
fn test_eviction_preserves_non_destroyable_contents() {
    let (manager, _dir) = create_manager(Some(100));

    let handle = manager.allocate(MemoryTag::OrderBy, 60, false).unwrap();
    fill(&handle, 0xBE);
    let block = Arc::clone(handle.block());
    drop(handle);

    // pressure forces the spill
    let other = manager.allocate(MemoryTag::HashTable, 60, true).unwrap();
    assert_eq!(block.state(), BlockState::OnTempDisk);
    assert_eq!(manager.temporary_files().len(), 1);
    drop(other);

    // read back transparently on the next pin
    let handle = manager.pin(&block).unwrap();
    assert_filled(&handle, 0xBE);
    assert_eq!(block.state(), BlockState::Loaded);
    // the swap file is released once the contents are back in memory
    assert!(manager.temporary_files().is_empty());
}

#[test]
fn test_eviction_discards_destroyable_contents() {
    let (manager, _dir) = create_manager(Some(100));

    let handle = manager.allocate(MemoryTag::OrderBy, 60, true).unwrap();
    fill(&handle, 0xBE);
    let block = Arc::clone(handle.block());
    drop(handle);

    let other = manager.allocate(MemoryTag::HashTable, 60, true).unwrap();
    assert_eq!(block.state(), BlockState::Unloaded);
    // nothing was written to disk
    assert!(manager.temporary_files().is_empty());
    drop(other);

    // re-pin yields zeroed memory, not the old contents
    let handle = manager.pin(&block).unwrap();
    assert_filled(&handle, 0x00);
}

#[test]
fn test_dropping_spilled_handle_removes_temp_file() {
    let (manager, _dir) = create_manager(Some(100));

    let handle = manager.allocate(MemoryTag::OrderBy, 40, false).unwrap();
    fill(&handle, 0x33);
    let block = Arc::clone(handle.block());
    drop(handle);

    let _other = manager.allocate(MemoryTag::HashTable, 80, true).unwrap();
    assert_eq!(block.state(), BlockState::OnTempDisk);
    assert_eq!(manager.temporary_files().len(), 1);
    assert_eq!(manager.used_swap(), 40 + 12); // payload + header

    // delete the handle without ever re-pinning
    drop(block);
    assert!(manager.temporary_files().is_empty());
    assert_eq!(manager.used_swap(), 0);
}

#[test]
fn test_spill_without_temp_directory_is_configuration_error() {
    let pool = BufferPool::new(Some(100));
    let manager = StandardBufferManager::new(pool, None);
    assert!(!manager.has_temporary_directory());

    let handle = manager.allocate(MemoryTag::OrderBy, 60, false).unwrap();
    let block = Arc::clone(handle.block());
    drop(handle);

    // eviction would need to spill, which is disabled
    let err = manager.allocate(MemoryTag::HashTable, 60, true).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    // the victim stays loaded and the failed allocation left no charge
    assert_eq!(block.state(), BlockState::Loaded);
    assert_eq!(manager.used_memory(), 60);
}

// ============================================================================
// Spec scenario: A, B, C, then D
// ============================================================================

#[test]
fn test_pressure_scenario_abcd() {
    let (manager, _dir) = create_manager(Some(100));
    let pool = Arc::clone(manager.buffer_pool());

    // register + pin + unpin each of A, B, C in order
    let a = manager.register_memory(MemoryTag::OrderBy, 40, false).unwrap();
    {
        let pinned = manager.pin(&a).unwrap();
        fill(&pinned, 0xAA);
    }
    let b = manager.register_memory(MemoryTag::OrderBy, 40, false).unwrap();
    {
        let pinned = manager.pin(&b).unwrap();
        fill(&pinned, 0xBB);
    }
    // C's registration already exceeds the limit: the earliest unpinned
    // block (A) is spilled to make room
    let c = manager.register_memory(MemoryTag::OrderBy, 40, true).unwrap();
    {
        let pinned = manager.pin(&c).unwrap();
        fill(&pinned, 0xCC);
    }
    assert_eq!(a.state(), BlockState::OnTempDisk);
    assert_eq!(b.state(), BlockState::Loaded);

    // D evicts exactly one more block: the earliest remaining (B)
    let evictions_before = pool.evictions();
    let d = manager.allocate(MemoryTag::OrderBy, 40, true).unwrap();
    assert_eq!(pool.evictions() - evictions_before, 1);
    assert_eq!(b.state(), BlockState::OnTempDisk);
    assert_eq!(c.state(), BlockState::Loaded);
    assert!(manager.used_memory() <= 100);
    drop(d);

    // both non-destroyable blocks round-trip losslessly
    {
        let pinned = manager.pin(&a).unwrap();
        assert_filled(&pinned, 0xAA);
    }
    {
        let pinned = manager.pin(&b).unwrap();
        assert_filled(&pinned, 0xBB);
    }
}

// ============================================================================
// Limits
// ============================================================================

#[test]
fn test_set_memory_limit_below_pinned_usage_rejected() {
    let (manager, _dir) = create_manager(Some(200));

    let _held = manager.allocate(MemoryTag::OrderBy, 150, true).unwrap();
    let err = manager.set_memory_limit(Some(100)).unwrap_err();
    assert!(err.is_out_of_memory());
    // limit unchanged
    assert_eq!(manager.max_memory(), Some(200));
}

#[test]
fn test_set_memory_limit_spills_evictable_blocks() {
    let (manager, _dir) = create_manager(Some(200));

    let handle = manager.allocate(MemoryTag::OrderBy, 150, false).unwrap();
    fill(&handle, 0x77);
    let block = Arc::clone(handle.block());
    drop(handle);

    manager.set_memory_limit(Some(100)).unwrap();
    assert_eq!(manager.max_memory(), Some(100));
    assert_eq!(block.state(), BlockState::OnTempDisk);
    assert_eq!(manager.used_memory(), 0);
}

#[test]
fn test_swap_limit_turns_spill_into_out_of_memory() {
    let (manager, _dir) = create_manager(Some(100));
    manager.set_swap_limit(Some(16)).unwrap();

    let handle = manager.allocate(MemoryTag::OrderBy, 60, false).unwrap();
    let block = Arc::clone(handle.block());
    drop(handle);

    // eviction must spill 60 bytes, which the swap budget cannot hold
    let err = manager.allocate(MemoryTag::HashTable, 60, true).unwrap_err();
    assert!(err.is_out_of_memory());
    assert_eq!(block.state(), BlockState::Loaded);
    assert_eq!(manager.used_swap(), 0);
}

#[test]
fn test_set_temporary_directory_rejected_while_in_use() {
    let (manager, dir) = create_manager(Some(100));

    let handle = manager.allocate(MemoryTag::OrderBy, 60, false).unwrap();
    drop(handle);
    let _other = manager.allocate(MemoryTag::HashTable, 60, true).unwrap();
    assert_eq!(manager.temporary_files().len(), 1);

    let err = manager
        .set_temporary_directory(dir.path().join("elsewhere"))
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

// ============================================================================
// Reallocate
// ============================================================================

#[test]
fn test_reallocate_grows_under_pressure() {
    let (manager, _dir) = create_manager(Some(100));

    // an evictable block occupying most of the budget
    let victim = manager.allocate(MemoryTag::HashTable, 60, false).unwrap();
    let victim_block = Arc::clone(victim.block());
    drop(victim);

    let handle = manager.allocate(MemoryTag::OrderBy, 30, true).unwrap();
    fill(&handle, 0x11);

    // growing past the limit forces the victim out
    manager.reallocate(handle.block(), 70).unwrap();
    assert_eq!(victim_block.state(), BlockState::OnTempDisk);
    assert_eq!(handle.len(), 70);
    // old contents survive in the common prefix
    assert_eq!(&handle.data()[..30], &[0x11; 30][..]);
    assert!(manager.used_memory() <= 100);
}

// ============================================================================
// Shared pool across managers
// ============================================================================

#[test]
fn test_two_managers_share_one_budget() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let pool = BufferPool::new(Some(100));
    let manager_a =
        StandardBufferManager::new(Arc::clone(&pool), Some(dir_a.path().join("swap")));
    let manager_b =
        StandardBufferManager::new(Arc::clone(&pool), Some(dir_b.path().join("swap")));

    let handle = manager_a.allocate(MemoryTag::OrderBy, 60, false).unwrap();
    fill(&handle, 0xA1);
    let block_a = Arc::clone(handle.block());
    drop(handle);

    // pressure from manager B evicts manager A's block, which spills into
    // A's own temp directory
    let held = manager_b.allocate(MemoryTag::HashTable, 60, true).unwrap();
    assert_eq!(block_a.state(), BlockState::OnTempDisk);
    assert_eq!(manager_a.temporary_files().len(), 1);
    assert!(manager_b.temporary_files().is_empty());
    drop(held);

    let handle = manager_a.pin(&block_a).unwrap();
    assert_filled(&handle, 0xA1);
    assert!(manager_a.used_memory() <= 100);
}

// ============================================================================
// Observability
// ============================================================================

#[test]
fn test_memory_usage_info_breakdown() {
    let (manager, _dir) = create_manager(None);

    let _order = manager.allocate(MemoryTag::OrderBy, 100, true).unwrap();
    let _hash = manager.allocate(MemoryTag::HashTable, 50, true).unwrap();

    let info = manager.memory_usage_info();
    assert_eq!(info.len(), MemoryTag::COUNT);
    let by_tag = |tag: MemoryTag| info.iter().find(|i| i.tag == tag).unwrap();
    assert_eq!(by_tag(MemoryTag::OrderBy).size, 100);
    assert_eq!(by_tag(MemoryTag::HashTable).size, 50);
    assert_eq!(by_tag(MemoryTag::Extension).size, 0);
}

#[test]
fn test_temporary_file_listing_contents() {
    let (manager, _dir) = create_manager(Some(100));

    let handle = manager.allocate(MemoryTag::OrderBy, 64, false).unwrap();
    let block = Arc::clone(handle.block());
    drop(handle);
    let _other = manager.allocate(MemoryTag::HashTable, 64, true).unwrap();

    let files = manager.temporary_files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].block_id, block.block_id());
    assert_eq!(files[0].size, 64);
    assert!(files[0].path.exists());
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_pin_unpin_under_pressure() {
    use std::thread;

    const THREADS: usize = 4;
    const BLOCK_SIZE: usize = 1024;
    const ITERATIONS: usize = 25;

    let (manager, _dir) = create_manager(Some(6 * 1024));

    // background blocks that exist only to be spilled
    let mut extras = Vec::new();
    for _ in 0..4 {
        let handle = manager
            .allocate(MemoryTag::ColumnData, BLOCK_SIZE, false)
            .unwrap();
        extras.push(Arc::clone(handle.block()));
    }

    // one marked block per worker thread
    let blocks: Vec<_> = (0..THREADS)
        .map(|i| {
            let handle = manager
                .allocate(MemoryTag::OrderBy, BLOCK_SIZE, false)
                .unwrap();
            fill(&handle, i as u8 + 1);
            Arc::clone(handle.block())
        })
        .collect();

    let mut handles = vec![];
    for (i, block) in blocks.iter().enumerate() {
        let manager = Arc::clone(&manager);
        let block = Arc::clone(block);
        handles.push(thread::spawn(move || {
            let marker = i as u8 + 1;
            for _ in 0..ITERATIONS {
                let pinned = manager.pin(&block).unwrap();
                assert!(pinned.data().iter().all(|&b| b == marker));
                pinned.data_mut().fill(marker);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // every marked block still holds its pattern
    for (i, block) in blocks.iter().enumerate() {
        let pinned = manager.pin(block).unwrap();
        assert!(pinned.data().iter().all(|&b| b == i as u8 + 1));
    }
}

#[test]
fn test_concurrent_allocations_respect_limit() {
    use std::thread;

    const LIMIT: usize = 64 * 1024;

    let (manager, _dir) = create_manager(Some(LIMIT));

    let mut handles = vec![];
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        handles.push(thread::spawn(move || {
            // keep every block alive so the total demand (400 KiB) far
            // exceeds the budget and eviction must run continuously
            let mut blocks = Vec::new();
            for _ in 0..50 {
                let pinned = manager.allocate(MemoryTag::HashTable, 1024, true).unwrap();
                pinned.data_mut()[0] = 0xFF;
                blocks.push(Arc::clone(pinned.block()));
            }
            blocks
        }));
    }
    let all_blocks: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    // each thread can contribute at most one in-flight reservation of
    // transient overshoot
    assert!(manager.used_memory() <= LIMIT + 8 * 1024);
    drop(all_blocks);
}

// ============================================================================
// Queue hygiene
// ============================================================================

#[test]
fn test_rapid_pin_unpin_does_not_grow_queue_unbounded() {
    let (manager, _dir) = create_manager(None);
    let pool = Arc::clone(manager.buffer_pool());

    let handle = manager.allocate(MemoryTag::OrderBy, 16, true).unwrap();
    let block = Arc::clone(handle.block());
    drop(handle);

    // thousands of cycles with zero memory pressure; the periodic purge
    // keeps the stale backlog bounded
    for _ in 0..10_000 {
        let pinned = manager.pin(&block).unwrap();
        drop(pinned);
    }
    assert!(pool.eviction_queue_len() <= 2048);
}

fn _trait_object_compiles(manager: &dyn BufferManager) -> Option<PathBuf> {
    manager.temporary_directory()
}
