//! Eviction queue - lazily purged queue of eviction candidates.
//!
//! Unpinning a block appends a cheap entry here; finding a victim under
//! memory pressure walks entries from the front, discarding stale ones.
//! This trades exact LRU order for O(1) bookkeeping on the pin/unpin path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use parking_lot::Mutex;
use tracing::debug;

use crate::buffer::block_handle::BlockHandle;
use crate::common::config::{EVICTION_QUEUE_PURGE_BATCH, EVICTION_QUEUE_PURGE_INTERVAL};
use crate::common::Result;

/// One eviction candidate.
///
/// The entry holds only a weak reference: the queue must never keep a block
/// alive on its own. The sequence number is the block's eviction sequence at
/// enqueue time; any later unpin bumps the block's sequence and obsoletes
/// this entry.
pub(crate) struct EvictionEntry {
    block: Weak<BlockHandle>,
    seq: u64,
}

impl EvictionEntry {
    /// An entry is stale if the block is gone, currently pinned, or was
    /// re-enqueued since this entry was recorded. Reads atomics only; no
    /// handle lock is taken.
    fn is_stale(&self) -> bool {
        match self.block.upgrade() {
            None => true,
            Some(handle) => handle.pin_count() > 0 || handle.eviction_seq() != self.seq,
        }
    }
}

/// Append-only queue of weak eviction candidates, shared by every buffer
/// manager registered with one pool.
///
/// # Thread Safety
/// The queue lock guards only the `VecDeque`; it is never held while a
/// block's residency lock is taken. Eviction pops an entry, releases the
/// queue lock, and only then inspects the candidate.
pub(crate) struct EvictionQueue {
    entries: Mutex<VecDeque<EvictionEntry>>,

    /// Insertions since the queue was created; drives periodic purging.
    insertions: AtomicU64,
}

impl EvictionQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            insertions: AtomicU64::new(0),
        }
    }

    /// Append a candidate. Called on every unpin that drops the pin count
    /// to zero, so this stays O(1): one short lock plus a counter bump.
    pub fn enqueue(&self, block: Weak<BlockHandle>, seq: u64) {
        self.entries.lock().push_back(EvictionEntry { block, seq });

        let n = self.insertions.fetch_add(1, Ordering::Relaxed) + 1;
        if n % EVICTION_QUEUE_PURGE_INTERVAL == 0 {
            self.purge();
        }
    }

    /// Pop candidates from the front until one can actually be evicted.
    ///
    /// Returns the number of bytes reclaimed, or `None` once the queue is
    /// exhausted. If evicting a candidate fails with an I/O error (a spill
    /// that could not be written), the entry is put back at the front so
    /// the block stays visible to future memory pressure, and the error
    /// propagates.
    pub fn try_evict_next(&self) -> Result<Option<usize>> {
        loop {
            let entry = match self.entries.lock().pop_front() {
                Some(entry) => entry,
                None => return Ok(None),
            };
            let Some(handle) = entry.block.upgrade() else {
                continue;
            };
            // Cheap pre-check before taking the residency lock. A block
            // whose state is not LOADED never has an entry carrying its
            // current sequence number, so candidates that pass this check
            // can be locked without deadlocking against an in-flight pin.
            if handle.pin_count() > 0 || handle.eviction_seq() != entry.seq {
                continue;
            }
            match handle.try_unload(entry.seq) {
                Ok(Some(freed)) => return Ok(Some(freed)),
                Ok(None) => continue,
                Err(e) => {
                    self.entries.lock().push_front(entry);
                    return Err(e);
                }
            }
        }
    }

    /// Bounded sweep dropping stale entries from the front of the queue,
    /// preserving the relative order of survivors. Never evicts.
    pub fn purge(&self) {
        let mut entries = self.entries.lock();
        let scan = entries.len().min(EVICTION_QUEUE_PURGE_BATCH);
        let mut kept: Vec<EvictionEntry> = Vec::new();
        let mut dropped = 0usize;
        for _ in 0..scan {
            let Some(entry) = entries.pop_front() else {
                break;
            };
            if entry.is_stale() {
                dropped += 1;
            } else {
                kept.push(entry);
            }
        }
        for entry in kept.into_iter().rev() {
            entries.push_front(entry);
        }
        if dropped > 0 {
            debug!(dropped, remaining = entries.len(), "purged eviction queue");
        }
    }

    /// Number of entries currently queued, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
