//! Temporary file store - swap space for evicted blocks.
//!
//! The [`TemporaryFileStore`] handles all direct file operations for
//! spilled blocks:
//! - Lazy, lock-guarded creation of the temporary directory
//! - Writing and reading back evicted block contents
//! - Releasing swap files and enforcing the swap-space budget

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::common::config::{TEMP_FILE_HEADER_SIZE, TEMP_FILE_PREFIX};
use crate::common::{BlockId, Error, MemoryTag, Result};

/// Description of one active swap file, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryFileInformation {
    /// The spilled block.
    pub block_id: BlockId,
    /// Payload size in bytes (excluding the file header).
    pub size: u64,
    /// Location of the swap file on disk.
    pub path: PathBuf,
}

/// The created temporary directory.
///
/// Dropping the handle removes the directory and everything left in it;
/// this runs when the owning buffer manager shuts down.
struct TemporaryDirectoryHandle {
    path: PathBuf,
}

impl Drop for TemporaryDirectoryHandle {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove temporary directory");
        }
    }
}

/// Registry entry for one spilled block.
struct TempFileEntry {
    tag: MemoryTag,
    /// Payload bytes, excluding the file header.
    size: u64,
}

/// Durable scratch storage for evicted blocks that cannot be discarded.
///
/// One store belongs to one buffer manager. Each spilled block gets its own
/// file named from the block id, laid out as:
/// ```text
/// ┌──────────────┬───────────────┬──────────────────┐
/// │ length (u64) │ CRC32 (u32)   │ payload bytes    │
/// └──────────────┴───────────────┴──────────────────┘
/// Offset: 0       8               12
/// ```
/// The checksum covers the payload and is verified on read-back, so a torn
/// or corrupted swap file surfaces as an I/O error instead of silently
/// wrong data.
///
/// # Thread Safety
/// - `path`: `Mutex` — settable until the directory handle exists
/// - `handle`: `OnceLock` — created once, then read lock-free
/// - `create_lock`: `Mutex` — serializes the one-time directory creation
/// - `files`: `Mutex` — registry of active swap files
/// - counters: atomics, eventually consistent snapshots
pub struct TemporaryFileStore {
    /// Configured directory path; `None` disables spilling.
    path: Mutex<Option<PathBuf>>,

    /// Create-once handle for the temporary directory.
    handle: OnceLock<TemporaryDirectoryHandle>,

    /// Guards lazy creation of `handle`.
    create_lock: Mutex<()>,

    /// Registry of spilled blocks.
    files: Mutex<HashMap<BlockId, TempFileEntry>>,

    /// Bytes on disk, including file headers.
    size_on_disk: AtomicU64,

    /// Swap-space ceiling in bytes; `u64::MAX` means unlimited.
    maximum_swap_space: AtomicU64,

    /// Payload bytes currently evicted to disk, per tag.
    evicted_per_tag: [AtomicU64; MemoryTag::COUNT],
}

impl TemporaryFileStore {
    /// Create a store rooted at `path`. Passing `None` disables spilling:
    /// any attempt to offload a block fails with a configuration error.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path: Mutex::new(path),
            handle: OnceLock::new(),
            create_lock: Mutex::new(()),
            files: Mutex::new(HashMap::new()),
            size_on_disk: AtomicU64::new(0),
            maximum_swap_space: AtomicU64::new(u64::MAX),
            evicted_per_tag: [const { AtomicU64::new(0) }; MemoryTag::COUNT],
        }
    }

    /// True if a temporary directory is configured.
    pub fn has_directory(&self) -> bool {
        self.path.lock().is_some()
    }

    /// The configured directory path, if any.
    pub fn directory(&self) -> Option<PathBuf> {
        self.path.lock().clone()
    }

    /// Point the store at a new directory.
    ///
    /// Rejected once the directory handle exists (i.e. once anything has
    /// been spilled): migrating live swap files is not supported.
    pub fn set_directory(&self, path: PathBuf) -> Result<()> {
        if self.handle.get().is_some() {
            return Err(Error::Configuration(
                "temporary directory cannot be changed while temporary files are in use"
                    .to_string(),
            ));
        }
        *self.path.lock() = Some(path);
        Ok(())
    }

    /// Bytes currently on disk, including file headers.
    pub fn size_on_disk(&self) -> u64 {
        self.size_on_disk.load(Ordering::Relaxed)
    }

    /// The swap-space ceiling, or `None` if unlimited.
    pub fn max_swap_space(&self) -> Option<u64> {
        match self.maximum_swap_space.load(Ordering::Relaxed) {
            u64::MAX => None,
            limit => Some(limit),
        }
    }

    /// Set the swap-space ceiling. `None` means unlimited.
    ///
    /// Rejected if the new ceiling is below the bytes already on disk.
    pub fn set_max_swap_space(&self, limit: Option<u64>) -> Result<()> {
        let new = limit.unwrap_or(u64::MAX);
        let used = self.size_on_disk.load(Ordering::Relaxed);
        if new < used {
            return Err(Error::Configuration(format!(
                "cannot set swap limit to {} bytes: {} bytes of swap space are in use",
                new, used
            )));
        }
        self.maximum_swap_space.store(new, Ordering::Relaxed);
        Ok(())
    }

    /// Payload bytes currently evicted to disk for one tag.
    pub fn evicted_by_tag(&self, tag: MemoryTag) -> u64 {
        self.evicted_per_tag[tag.index()].load(Ordering::Relaxed)
    }

    /// List all active swap files.
    pub fn temporary_files(&self) -> Vec<TemporaryFileInformation> {
        let files = self.files.lock();
        let Some(dir) = self.handle.get() else {
            return Vec::new();
        };
        files
            .iter()
            .map(|(&block_id, entry)| TemporaryFileInformation {
                block_id,
                size: entry.size,
                path: Self::block_path(&dir.path, block_id),
            })
            .collect()
    }

    /// Path of the swap file for one block.
    fn block_path(dir: &Path, block_id: BlockId) -> PathBuf {
        dir.join(format!("{}{}.tmp", TEMP_FILE_PREFIX, block_id.index()))
    }

    /// Get the temporary directory handle, creating the directory on first
    /// use. Creation is guarded by `create_lock`; later callers observe the
    /// published handle without locking.
    fn require_directory(&self) -> Result<&TemporaryDirectoryHandle> {
        if let Some(handle) = self.handle.get() {
            return Ok(handle);
        }
        let _guard = self.create_lock.lock();
        if let Some(handle) = self.handle.get() {
            return Ok(handle);
        }
        let path = self.path.lock().clone().ok_or_else(|| {
            Error::Configuration(
                "cannot offload block: no temporary directory is configured. \
                 Set a temporary directory to enable offloading unused blocks to disk"
                    .to_string(),
            )
        })?;
        fs::create_dir_all(&path)?;
        info!(path = %path.display(), "created temporary directory");
        let _ = self.handle.set(TemporaryDirectoryHandle { path });
        match self.handle.get() {
            Some(handle) => Ok(handle),
            None => unreachable!("temporary directory handle was just published"),
        }
    }

    /// Write a block's contents to its swap file.
    ///
    /// The swap budget is claimed up front and rolled back if the write
    /// fails, so a failed spill leaves no partial file and no phantom
    /// accounting.
    pub fn write_block(&self, tag: MemoryTag, block_id: BlockId, payload: &[u8]) -> Result<()> {
        let dir = self.require_directory()?;

        let total = payload.len() as u64 + TEMP_FILE_HEADER_SIZE;
        let limit = self.maximum_swap_space.load(Ordering::Relaxed);
        let claimed = self.size_on_disk.fetch_add(total, Ordering::Relaxed) + total;
        if claimed > limit {
            self.size_on_disk.fetch_sub(total, Ordering::Relaxed);
            return Err(Error::OutOfMemory {
                reason: format!("swap limit reached while offloading {}", block_id),
                used: (claimed - total) as usize,
                limit: limit as usize,
            });
        }

        let path = Self::block_path(&dir.path, block_id);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        let checksum = hasher.finalize();

        let write = (|| -> Result<()> {
            let mut file = File::create(&path)?;
            file.write_all(&(payload.len() as u64).to_le_bytes())?;
            file.write_all(&checksum.to_le_bytes())?;
            file.write_all(payload)?;
            Ok(())
        })();

        if let Err(e) = write {
            let _ = fs::remove_file(&path);
            self.size_on_disk.fetch_sub(total, Ordering::Relaxed);
            return Err(e);
        }

        self.files.lock().insert(
            block_id,
            TempFileEntry {
                tag,
                size: payload.len() as u64,
            },
        );
        self.evicted_per_tag[tag.index()].fetch_add(payload.len() as u64, Ordering::Relaxed);
        debug!(block_id = %block_id, bytes = payload.len(), "wrote block to temporary file");
        Ok(())
    }

    /// Read a block's contents back from its swap file.
    ///
    /// Verifies the payload checksum; a mismatch surfaces as an I/O error
    /// and the swap file is left in place.
    pub fn read_block(&self, block_id: BlockId) -> Result<Box<[u8]>> {
        {
            let files = self.files.lock();
            if !files.contains_key(&block_id) {
                return Err(Error::InvalidState(format!(
                    "no temporary file exists for {}",
                    block_id
                )));
            }
        }
        let dir = match self.handle.get() {
            Some(dir) => dir,
            None => {
                return Err(Error::InvalidState(format!(
                    "no temporary directory exists to read {} from",
                    block_id
                )))
            }
        };
        let path = Self::block_path(&dir.path, block_id);

        let mut file = File::open(&path)?;
        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != stored_checksum {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("checksum mismatch in temporary file for {}", block_id),
            )));
        }

        debug!(block_id = %block_id, bytes = len, "read block back from temporary file");
        Ok(payload.into_boxed_slice())
    }

    /// Release the swap file for one block.
    ///
    /// A no-op for blocks with no swap file. Accounting is adjusted before
    /// the file is unlinked, so counters stay consistent even if the unlink
    /// fails.
    pub fn delete_block(&self, block_id: BlockId) -> Result<()> {
        let entry = match self.files.lock().remove(&block_id) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        self.size_on_disk
            .fetch_sub(entry.size + TEMP_FILE_HEADER_SIZE, Ordering::Relaxed);
        self.evicted_per_tag[entry.tag.index()].fetch_sub(entry.size, Ordering::Relaxed);

        let Some(dir) = self.handle.get() else {
            return Ok(());
        };
        let path = Self::block_path(&dir.path, block_id);
        fs::remove_file(&path)?;
        debug!(block_id = %block_id, "deleted temporary file");
        Ok(())
    }
}
