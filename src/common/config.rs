//! Configuration constants for the buffer layer.

/// Number of eviction-queue insertions between automatic purge sweeps.
///
/// Blocks that cycle pin/unpin rapidly without ever triggering eviction
/// leave a trail of stale entries behind; the periodic sweep bounds that
/// growth without touching the eviction hot path.
pub const EVICTION_QUEUE_PURGE_INTERVAL: u64 = 256;

/// Maximum number of entries inspected by a single purge sweep. Must be at
/// least the purge interval, or sweeps fall behind insertions and the
/// backlog grows without bound.
pub const EVICTION_QUEUE_PURGE_BATCH: usize = 1024;

/// Byte pattern written over a block's retired allocation by the
/// zero-reader check (debug builds only).
pub const POISON_BYTE: u8 = 0xA5;

/// Size of the header prepended to every temporary swap file:
/// 8-byte payload length + 4-byte CRC32 of the payload, both little-endian.
pub const TEMP_FILE_HEADER_SIZE: u64 = 12;

/// File-name prefix for temporary swap files.
pub const TEMP_FILE_PREFIX: &str = "oxbow_temp_block-";
